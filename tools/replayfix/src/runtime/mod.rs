use crate::errors::FixtureError;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Work handed to a [`Scheduler`] to run later, off the caller's stack.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, FixtureError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FixtureError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), FixtureError>;
    fn remove_file(&self, path: &Path) -> Result<(), FixtureError>;
    fn exists(&self, path: &Path) -> bool;
    /// Files directly inside `path`. A missing directory lists as empty.
    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>, FixtureError>;
}

/// Delivers completions on a later turn so callers never observe them
/// re-entrantly from inside the call that started the work.
pub trait Scheduler: Send + Sync {
    fn defer(&self, task: Task);
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FixtureError> {
        std::fs::read_to_string(path).map_err(|e| FixtureError::Io(e.to_string()))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FixtureError> {
        std::fs::write(path, contents).map_err(|e| FixtureError::Io(e.to_string()))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FixtureError> {
        std::fs::create_dir_all(path).map_err(|e| FixtureError::Io(e.to_string()))
    }

    fn remove_file(&self, path: &Path) -> Result<(), FixtureError> {
        std::fs::remove_file(path).map_err(|e| FixtureError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>, FixtureError> {
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = std::fs::read_dir(path)
            .map_err(|e| FixtureError::Io(e.to_string()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

/// Runs each task on its own short-lived thread.
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn defer(&self, task: Task) {
        std::thread::spawn(task);
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<FixtureError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn set_fail_next(&self, error: FixtureError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        self.dirs.lock().expect("dirs lock").clone()
    }

    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut paths = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        paths.sort();
        paths
    }

    fn maybe_fail(&self) -> Result<(), FixtureError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FixtureError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| FixtureError::Io(format!("missing file {}", path.display())))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FixtureError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FixtureError> {
        self.maybe_fail()?;
        self.dirs
            .lock()
            .expect("dirs lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), FixtureError> {
        self.maybe_fail()?;
        self.files.lock().expect("files lock").remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }

    fn list_files(&self, path: &Path) -> Result<Vec<PathBuf>, FixtureError> {
        self.maybe_fail()?;
        let mut files = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|file| file.parent() == Some(path))
            .cloned()
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

/// Queues deferred tasks until the test drains them with `run_pending`.
#[derive(Default, Clone)]
pub struct ManualScheduler {
    queue: Arc<Mutex<VecDeque<Task>>>,
}

impl ManualScheduler {
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }

    /// Runs queued tasks, including ones queued while draining. Returns how
    /// many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.queue.lock().expect("queue lock").pop_front();
            let Some(task) = next else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl Scheduler for ManualScheduler {
    fn defer(&self, task: Task) {
        self.queue.lock().expect("queue lock").push_back(task);
    }
}
