use crate::errors::FixtureError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), FixtureError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| FixtureError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| FixtureError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| FixtureError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| FixtureError::Io(e.to_string()))
    }
}

struct RunLogger {
    logger: JsonlLogger,
    write_lock: Mutex<()>,
}

static RUN_LOGGER: OnceLock<Mutex<Option<Arc<RunLogger>>>> = OnceLock::new();

fn run_logger_slot() -> &'static Mutex<Option<Arc<RunLogger>>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Route `append_run_log` events to `path` for the rest of the process.
pub fn init_run_logger(path: impl AsRef<Path>) -> Result<(), FixtureError> {
    let logger = JsonlLogger::new(path);
    if let Some(parent) = logger.path.parent() {
        fs::create_dir_all(parent).map_err(|e| FixtureError::Io(e.to_string()))?;
    }
    *run_logger_slot().lock().expect("run logger init lock") = Some(Arc::new(RunLogger {
        logger,
        write_lock: Mutex::new(()),
    }));
    Ok(())
}

pub fn clear_run_logger() {
    *run_logger_slot().lock().expect("run logger clear lock") = None;
}

/// Append one event to the run log. A no-op until `init_run_logger` runs;
/// write failures are dropped so logging never fails a fixture call.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let guard = run_logger_slot().lock().expect("run logger emit lock");
    let Some(state) = guard.as_ref().map(Arc::clone) else {
        return;
    };
    drop(guard);
    let _write = state.write_lock.lock().expect("run logger write lock");
    let _ = state.logger.append(&LogEvent {
        level,
        event_type,
        payload,
    });
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}
