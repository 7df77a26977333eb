//! Per-test call ordinals.
//!
//! The ordinal, not argument content, tells repeated calls to one method apart:
//! the Nth call of `method` in `test` always gets ordinal N-1, whatever it was
//! called with.

use crate::logging::append_run_log;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct CallSequencer {
    next: Mutex<HashMap<(String, String), u64>>,
}

impl CallSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the ordinal for this call and advances the counter.
    pub fn next_ordinal(&self, test_identity: &str, method: &str) -> u64 {
        let mut next = self.next.lock().expect("sequencer lock");
        let slot = next
            .entry((test_identity.to_string(), method.to_string()))
            .or_insert(0);
        let ordinal = *slot;
        *slot += 1;
        ordinal
    }

    /// The ordinal the next call would get, without consuming it.
    pub fn peek(&self, test_identity: &str, method: &str) -> u64 {
        self.next
            .lock()
            .expect("sequencer lock")
            .get(&(test_identity.to_string(), method.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn reset(&self, test_identity: &str) {
        let mut next = self.next.lock().expect("sequencer lock");
        let before = next.len();
        next.retain(|(test, _), _| test != test_identity);
        let cleared = before - next.len();
        drop(next);
        append_run_log(
            "debug",
            "sequencer.reset",
            json!({
                "test": test_identity,
                "cleared_methods": cleared
            }),
        );
    }

    pub fn clear(&self) {
        self.next.lock().expect("sequencer lock").clear();
    }
}
