//! Test identity and setup/teardown for fixture sequencing.
//!
//! A `TestContext` owns the call sequencer. `begin_test` is the setup hook
//! (fresh ordinals for the test) and dropping the returned `TestScope` is the
//! teardown hook. Use one context per test when tests run in parallel.

use crate::errors::FixtureError;
use crate::sequencer::CallSequencer;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct TestContext {
    sequencer: CallSequencer,
    current: Mutex<Option<String>>,
}

impl TestContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin_test(self: &Arc<Self>, test_identity: impl Into<String>) -> TestScope {
        let test_identity = test_identity.into();
        self.sequencer.reset(&test_identity);
        *self.current.lock().expect("current test lock") = Some(test_identity.clone());
        TestScope {
            context: Arc::clone(self),
            test_identity,
        }
    }

    /// Clears the active test and its ordinals. Idempotent.
    pub fn end_test(&self) {
        let ended = self.current.lock().expect("current test lock").take();
        if let Some(test_identity) = ended {
            self.sequencer.reset(&test_identity);
        }
    }

    pub fn current_test(&self) -> Option<String> {
        self.current.lock().expect("current test lock").clone()
    }

    /// The explicitly begun test, else the name of the harness thread
    /// running the caller.
    pub fn resolve_test_identity(&self) -> Result<String, FixtureError> {
        self.resolve_test_identity_with(None)
    }

    /// Like `resolve_test_identity`, but `bound` (the identity seen when the
    /// method was wrapped) is preferred over the calling thread's name.
    /// Callbacks run on worker threads, so calls made from inside them
    /// only find their test through `bound`.
    pub fn resolve_test_identity_with(
        &self,
        bound: Option<&str>,
    ) -> Result<String, FixtureError> {
        self.current_test()
            .or_else(|| bound.map(str::to_string))
            .or_else(current_test_identity)
            .ok_or(FixtureError::NoActiveTest)
    }

    pub fn sequencer(&self) -> &CallSequencer {
        &self.sequencer
    }
}

/// Ends its test when dropped.
#[derive(Debug)]
pub struct TestScope {
    context: Arc<TestContext>,
    test_identity: String,
}

impl TestScope {
    pub fn test_identity(&self) -> &str {
        &self.test_identity
    }
}

impl Drop for TestScope {
    fn drop(&mut self) {
        let still_current =
            self.context.current_test().as_deref() == Some(self.test_identity.as_str());
        if still_current {
            self.context.end_test();
        }
    }
}

/// libtest names each test thread after the test's path
/// (`module::test_name`); the main thread is not a test.
pub fn current_test_identity() -> Option<String> {
    std::thread::current()
        .name()
        .filter(|name| *name != "main")
        .map(str::to_string)
}
