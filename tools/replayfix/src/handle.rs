//! `wrap` and the stub handle it returns.

use crate::config::FixtureConfig;
use crate::dispatcher::{DispatcherParts, FaultLog, MismatchPolicy, Mode, ModeDispatcher};
use crate::errors::FixtureError;
use crate::lifecycle::{current_test_identity, TestContext};
use crate::logging::append_run_log;
use crate::method::MethodHost;
use crate::runtime::{FileSystem, ProductionFileSystem, Scheduler, ThreadScheduler};
use crate::store::FixtureStore;
use crate::stub::{SlotStubber, Spy, Stubber};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

pub struct WrapOptions {
    pub mode: Mode,
    pub dir: PathBuf,
    pub context: Arc<TestContext>,
    pub stubber: Arc<dyn Stubber>,
    pub file_system: Arc<dyn FileSystem>,
    pub scheduler: Arc<dyn Scheduler>,
    pub on_mismatch: MismatchPolicy,
}

impl WrapOptions {
    pub fn new(mode: Mode, dir: impl Into<PathBuf>, context: Arc<TestContext>) -> Self {
        Self {
            mode,
            dir: dir.into(),
            context,
            stubber: Arc::new(SlotStubber),
            file_system: Arc::new(ProductionFileSystem),
            scheduler: Arc::new(ThreadScheduler),
            on_mismatch: MismatchPolicy::default(),
        }
    }

    pub fn from_config(cfg: &FixtureConfig, context: Arc<TestContext>) -> Self {
        Self::new(cfg.mode, cfg.dir.clone(), context).with_mismatch_policy(cfg.on_mismatch)
    }

    pub fn with_stubber(mut self, stubber: Arc<dyn Stubber>) -> Self {
        self.stubber = stubber;
        self
    }

    pub fn with_file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = file_system;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_mismatch_policy(mut self, on_mismatch: MismatchPolicy) -> Self {
        self.on_mismatch = on_mismatch;
        self
    }
}

/// Replaces `target`'s `method_name` with a fixture dispatcher until the
/// returned handle is restored or dropped.
pub fn wrap<H>(
    target: Arc<H>,
    method_name: &str,
    options: WrapOptions,
) -> Result<FixtureStub, FixtureError>
where
    H: MethodHost + 'static,
{
    let host: Arc<dyn MethodHost> = target;
    let original = host
        .methods()
        .get(method_name)
        .ok_or_else(|| FixtureError::MethodNotFound {
            method: method_name.to_string(),
        })?;
    let store = Arc::new(FixtureStore::new(&options.dir, options.file_system));
    let faults = Arc::new(FaultLog::default());
    let dispatcher = ModeDispatcher::new(DispatcherParts {
        method: method_name.to_string(),
        mode: options.mode,
        original,
        store: Arc::clone(&store),
        context: options.context,
        scheduler: options.scheduler,
        on_mismatch: options.on_mismatch,
        faults: Arc::clone(&faults),
        bound_test: current_test_identity(),
    });
    let spy = options
        .stubber
        .replace(host, method_name, Arc::new(dispatcher))?;
    append_run_log(
        "info",
        "fixture.wrap.installed",
        json!({
            "method": method_name,
            "mode": options.mode.as_str(),
            "dir": store.dir().display().to_string()
        }),
    );
    Ok(FixtureStub {
        spy,
        mode: options.mode,
        store,
        faults,
    })
}

pub struct FixtureStub {
    spy: Spy,
    mode: Mode,
    store: Arc<FixtureStore>,
    faults: Arc<FaultLog>,
}

impl FixtureStub {
    /// Calls observed while wrapped, in every mode.
    pub fn call_count(&self) -> u64 {
        self.spy.call_count()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn method_name(&self) -> &str {
        self.spy.method()
    }

    pub fn store(&self) -> &FixtureStore {
        &self.store
    }

    /// Out-of-band failures (missing fixtures, storage errors, mismatches
    /// under `fail`) in the order they happened. Reading them marks them
    /// observed, so dropping the handle afterwards does not panic.
    pub fn faults(&self) -> Vec<FixtureError> {
        self.faults.observe()
    }

    pub fn is_restored(&self) -> bool {
        self.spy.is_restored()
    }

    /// Puts the original method back. Safe to call repeatedly; returns
    /// whether this call did the reinstall.
    pub fn restore(&self) -> bool {
        let restored = self.spy.restore();
        if restored {
            append_run_log(
                "info",
                "fixture.wrap.restored",
                json!({
                    "method": self.spy.method(),
                    "mode": self.mode.as_str(),
                    "call_count": self.spy.call_count(),
                    "faults": self.faults.len()
                }),
            );
        }
        restored
    }
}

impl Drop for FixtureStub {
    /// Restores, then fails the test if a fault that never reached the
    /// caller (a capture write that failed) was also never read.
    fn drop(&mut self) {
        self.restore();
        let unobserved = self.faults.unobserved_count();
        if unobserved > 0 && !std::thread::panicking() {
            let faults = self
                .faults
                .observe()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            panic!(
                "fixture stub for `{}` dropped with {unobserved} unobserved fault(s): {}",
                self.spy.method(),
                faults.join("; ")
            );
        }
    }
}
