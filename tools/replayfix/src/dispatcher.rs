//! The replacement method installed by `wrap`.
//!
//! - `live`: forward untouched.
//! - `capture`: forward, and persist `{fingerprint, result}` under the call's
//!   ordinal before handing the result back.
//! - `replay`: never touch the original; answer from the stored record on a
//!   later scheduler turn, or fail the call out-of-band when nothing is
//!   recorded.
//!
//! Ordinals are taken when a call starts, so overlapping calls keep the same
//! numbering in capture and replay however their completions interleave.

use crate::errors::FixtureError;
use crate::fingerprint::{decode, encode, encode_args, CanonicalForm};
use crate::lifecycle::TestContext;
use crate::logging::append_run_log;
use crate::method::{AsyncMethod, Callback};
use crate::runtime::Scheduler;
use crate::store::{FixtureKey, FixtureStore};
use crate::value::{ArgValue, CallOutcome};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Live,
    Capture,
    Replay,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Capture => "capture",
            Self::Replay => "replay",
        }
    }
}

impl FromStr for Mode {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "capture" => Ok(Self::Capture),
            "replay" => Ok(Self::Replay),
            other => Err(FixtureError::InvalidConfig(format!(
                "unknown fixture mode `{other}` (expected live, capture or replay)"
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What replay does when a record exists but its fingerprint differs from
/// the current call's arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    Ignore,
    #[default]
    Warn,
    Fail,
}

impl MismatchPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Warn => "warn",
            Self::Fail => "fail",
        }
    }
}

impl FromStr for MismatchPolicy {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "warn" => Ok(Self::Warn),
            "fail" => Ok(Self::Fail),
            other => Err(FixtureError::InvalidConfig(format!(
                "unknown mismatch policy `{other}` (expected ignore, warn or fail)"
            ))),
        }
    }
}

/// Out-of-band errors seen by a dispatcher, shared with its stub handle.
///
/// Errors that also went back to the caller as an `Err` are observed on
/// arrival. The rest (capture storage failures, whose callback is dropped)
/// stay unobserved until read through [`FaultLog::observe`].
#[derive(Debug, Default)]
pub struct FaultLog {
    entries: Mutex<Vec<FixtureError>>,
    unobserved: AtomicUsize,
}

impl FaultLog {
    /// Records an error that is returned to the caller as well.
    pub fn raised(&self, err: FixtureError) -> FixtureError {
        self.push(&err);
        err
    }

    /// Records an error the caller has no other way to see.
    pub fn silent(&self, err: FixtureError) {
        self.push(&err);
        self.unobserved.fetch_add(1, Ordering::SeqCst);
    }

    /// All faults so far, in order. Marks them observed.
    pub fn observe(&self) -> Vec<FixtureError> {
        let entries = self.snapshot();
        self.unobserved.store(0, Ordering::SeqCst);
        entries
    }

    pub fn snapshot(&self) -> Vec<FixtureError> {
        self.entries.lock().expect("fault log lock").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("fault log lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unobserved_count(&self) -> usize {
        self.unobserved.load(Ordering::SeqCst)
    }

    fn push(&self, err: &FixtureError) {
        let event_type = match err {
            FixtureError::MissingFixture { .. } => "fixture.replay.missing",
            FixtureError::FingerprintMismatch { .. } => "fixture.fingerprint.mismatch",
            FixtureError::Storage(_) => "fixture.storage.failed",
            _ => "fixture.call.failed",
        };
        append_run_log("error", event_type, json!({ "error": err.to_string() }));
        self.entries
            .lock()
            .expect("fault log lock")
            .push(err.clone());
    }
}

pub struct ModeDispatcher {
    method: String,
    mode: Mode,
    original: Arc<dyn AsyncMethod>,
    store: Arc<FixtureStore>,
    context: Arc<TestContext>,
    scheduler: Arc<dyn Scheduler>,
    on_mismatch: MismatchPolicy,
    faults: Arc<FaultLog>,
    bound_test: Option<String>,
}

pub struct DispatcherParts {
    pub method: String,
    pub mode: Mode,
    pub original: Arc<dyn AsyncMethod>,
    pub store: Arc<FixtureStore>,
    pub context: Arc<TestContext>,
    pub scheduler: Arc<dyn Scheduler>,
    pub on_mismatch: MismatchPolicy,
    pub faults: Arc<FaultLog>,
    /// Test identity of the wrapping thread, used when a call arrives on a
    /// thread that carries none.
    pub bound_test: Option<String>,
}

impl ModeDispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Self {
            method: parts.method,
            mode: parts.mode,
            original: parts.original,
            store: parts.store,
            context: parts.context,
            scheduler: parts.scheduler,
            on_mismatch: parts.on_mismatch,
            faults: parts.faults,
            bound_test: parts.bound_test,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn next_key(&self) -> Result<FixtureKey, FixtureError> {
        let test_identity = self
            .context
            .resolve_test_identity_with(self.bound_test.as_deref())
            .map_err(|err| self.faults.raised(err))?;
        let ordinal = self
            .context
            .sequencer()
            .next_ordinal(&test_identity, &self.method);
        Ok(FixtureKey::new(test_identity, self.method.clone(), ordinal))
    }

    fn capture(&self, args: Vec<ArgValue>, callback: Callback) -> Result<(), FixtureError> {
        let key = self.next_key()?;
        let fingerprint = encode_args(&args);
        let store = Arc::clone(&self.store);
        let faults = Arc::clone(&self.faults);
        let recorder: Callback = Box::new(move |outcome| {
            match store.write(&key, fingerprint, outcome_to_record(&outcome)) {
                Ok(path) => {
                    append_run_log(
                        "debug",
                        "fixture.capture.written",
                        json!({
                            "test": key.test_identity,
                            "method": key.method,
                            "ordinal": key.ordinal,
                            "path": path.display().to_string()
                        }),
                    );
                    callback(outcome);
                }
                // Callback is dropped; the fault surfaces on the handle.
                Err(err) => {
                    faults.silent(err);
                }
            }
        });
        self.original.call(args, recorder)
    }

    fn replay(&self, args: Vec<ArgValue>, callback: Callback) -> Result<(), FixtureError> {
        let key = self.next_key()?;
        let record = match self.store.read(&key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(self.faults.raised(FixtureError::MissingFixture {
                    test: key.test_identity.clone(),
                    method: key.method.clone(),
                    ordinal: key.ordinal,
                    path: self.store.path_for(&key).display().to_string(),
                }));
            }
            Err(err) => return Err(self.faults.raised(err)),
        };

        let fingerprint = encode_args(&args);
        if fingerprint != record.fingerprint {
            match self.on_mismatch {
                MismatchPolicy::Ignore => {}
                MismatchPolicy::Warn => append_run_log(
                    "warn",
                    "fixture.fingerprint.mismatch",
                    json!({
                        "test": key.test_identity,
                        "method": key.method,
                        "ordinal": key.ordinal,
                        "recorded": record.fingerprint.digest(),
                        "current": fingerprint.digest()
                    }),
                ),
                MismatchPolicy::Fail => {
                    return Err(self.faults.raised(FixtureError::FingerprintMismatch {
                        test: key.test_identity,
                        method: key.method,
                        ordinal: key.ordinal,
                    }));
                }
            }
        }

        append_run_log(
            "debug",
            "fixture.replay.hit",
            json!({
                "test": key.test_identity,
                "method": key.method,
                "ordinal": key.ordinal
            }),
        );
        let outcome = outcome_from_record(&record.result);
        self.scheduler.defer(Box::new(move || callback(outcome)));
        Ok(())
    }
}

impl AsyncMethod for ModeDispatcher {
    fn call(&self, args: Vec<ArgValue>, callback: Callback) -> Result<(), FixtureError> {
        match self.mode {
            Mode::Live => self.original.call(args, callback),
            Mode::Capture => self.capture(args, callback),
            Mode::Replay => self.replay(args, callback),
        }
    }
}

/// Callback arguments in stored order: the error slot, then the payload.
pub fn outcome_to_record(outcome: &CallOutcome) -> Vec<CanonicalForm> {
    match outcome {
        Ok(payload) => std::iter::once(CanonicalForm::Null)
            .chain(payload.iter().map(encode))
            .collect(),
        Err(error) => vec![encode(error)],
    }
}

/// A null (or absent) error slot means success.
pub fn outcome_from_record(result: &[CanonicalForm]) -> CallOutcome {
    match result.split_first() {
        None => Ok(Vec::new()),
        Some((CanonicalForm::Null, payload)) => Ok(payload.iter().map(decode).collect()),
        Some((error, _)) => Err(decode(error)),
    }
}
