//! On-disk fixture records, one JSON file per (test, method, ordinal).
//!
//! Layout under the fixture directory:
//!
//! ```text
//! <dir>/<slug(test)>-<h(test)>/<slug(method)>-<h(method)>-<ordinal>.json
//! ```
//!
//! `slug` keeps ASCII alphanumerics, `-` and `_` and maps everything else to
//! `_`; `h` is the first 16 hex chars of the SHA-256 of the raw string. The
//! hash keeps addresses distinct when two names share a slug.

use crate::errors::FixtureError;
use crate::fingerprint::CanonicalForm;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const SLUG_MAX_CHARS: usize = 64;
const FIXTURE_EXT: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixtureKey {
    pub test_identity: String,
    pub method: String,
    pub ordinal: u64,
}

impl FixtureKey {
    pub fn new(test_identity: impl Into<String>, method: impl Into<String>, ordinal: u64) -> Self {
        Self {
            test_identity: test_identity.into(),
            method: method.into(),
            ordinal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub fingerprint: CanonicalForm,
    /// Callback arguments: error-or-null first, then the success payload.
    pub result: Vec<CanonicalForm>,
    #[serde(default)]
    pub key: Option<FixtureKey>,
    #[serde(default)]
    pub recorded_at_unix_ns: u64,
}

pub struct FixtureStore {
    dir: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl FixtureStore {
    pub fn new(dir: impl AsRef<Path>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            fs,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn test_dir(&self, test_identity: &str) -> PathBuf {
        self.dir.join(addressed_segment(test_identity))
    }

    pub fn path_for(&self, key: &FixtureKey) -> PathBuf {
        self.test_dir(&key.test_identity).join(format!(
            "{}-{}.{FIXTURE_EXT}",
            addressed_segment(&key.method),
            key.ordinal
        ))
    }

    /// Writes (or overwrites) the record for `key`.
    pub fn write(
        &self,
        key: &FixtureKey,
        fingerprint: CanonicalForm,
        result: Vec<CanonicalForm>,
    ) -> Result<PathBuf, FixtureError> {
        let record = FixtureRecord {
            fingerprint,
            result,
            key: Some(key.clone()),
            recorded_at_unix_ns: timestamp_ns(),
        };
        let rendered = serde_json::to_string_pretty(&record)
            .map_err(|e| FixtureError::Storage(e.to_string()))?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).map_err(storage_error)?;
        }
        self.fs
            .write_string(&path, &format!("{rendered}\n"))
            .map_err(storage_error)?;
        Ok(path)
    }

    /// `Ok(None)` when nothing was recorded for `key`.
    pub fn read(&self, key: &FixtureKey) -> Result<Option<FixtureRecord>, FixtureError> {
        let path = self.path_for(key);
        if !self.fs.exists(&path) {
            return Ok(None);
        }
        let raw = self.fs.read_to_string(&path).map_err(storage_error)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| FixtureError::Storage(format!("{}: {e}", path.display())))
    }

    /// Recorded keys for a test, ordered by method then ordinal. Files
    /// without an embedded key are skipped.
    pub fn list(&self, test_identity: &str) -> Result<Vec<FixtureKey>, FixtureError> {
        let mut keys = Vec::new();
        for path in self
            .fs
            .list_files(&self.test_dir(test_identity))
            .map_err(storage_error)?
        {
            if path.extension().and_then(|ext| ext.to_str()) != Some(FIXTURE_EXT) {
                continue;
            }
            let raw = self.fs.read_to_string(&path).map_err(storage_error)?;
            let record: FixtureRecord = serde_json::from_str(&raw)
                .map_err(|e| FixtureError::Storage(format!("{}: {e}", path.display())))?;
            if let Some(key) = record.key {
                keys.push(key);
            }
        }
        keys.sort_by(|a, b| a.method.cmp(&b.method).then(a.ordinal.cmp(&b.ordinal)));
        Ok(keys)
    }

    /// Deletes every fixture file recorded for a test. Returns how many.
    pub fn remove_test(&self, test_identity: &str) -> Result<usize, FixtureError> {
        let files = self
            .fs
            .list_files(&self.test_dir(test_identity))
            .map_err(storage_error)?;
        for path in &files {
            self.fs.remove_file(path).map_err(storage_error)?;
        }
        Ok(files.len())
    }
}

fn storage_error(err: FixtureError) -> FixtureError {
    match err {
        FixtureError::Storage(_) => err,
        other => FixtureError::Storage(other.to_string()),
    }
}

fn addressed_segment(raw: &str) -> String {
    format!("{}-{}", slug(raw), short_hash(raw))
}

pub fn slug(raw: &str) -> String {
    let slug = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(SLUG_MAX_CHARS)
        .collect::<String>();
    if slug.is_empty() {
        "_".to_string()
    } else {
        slug
    }
}

fn short_hash(raw: &str) -> String {
    let hash = Sha256::digest(raw.as_bytes());
    hash[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
