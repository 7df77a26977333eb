//! Spy/stub utility: install a replacement method, count its calls, and put
//! the original back.

use crate::errors::FixtureError;
use crate::method::{AsyncMethod, Callback, MethodHost};
use crate::value::ArgValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub trait Stubber: Send + Sync {
    fn replace(
        &self,
        host: Arc<dyn MethodHost>,
        method: &str,
        replacement: Arc<dyn AsyncMethod>,
    ) -> Result<Spy, FixtureError>;
}

/// Swaps the host's method slot in place.
pub struct SlotStubber;

impl Stubber for SlotStubber {
    fn replace(
        &self,
        host: Arc<dyn MethodHost>,
        method: &str,
        replacement: Arc<dyn AsyncMethod>,
    ) -> Result<Spy, FixtureError> {
        Spy::install(host, method, replacement)
    }
}

#[derive(Default)]
struct SpyState {
    calls: AtomicU64,
    active: AtomicBool,
}

struct CountingMethod {
    inner: Arc<dyn AsyncMethod>,
    state: Arc<SpyState>,
}

impl AsyncMethod for CountingMethod {
    fn call(&self, args: Vec<ArgValue>, callback: Callback) -> Result<(), FixtureError> {
        if self.state.active.load(Ordering::SeqCst) {
            self.state.calls.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.call(args, callback)
    }

    fn is_stub(&self) -> bool {
        true
    }
}

pub struct Spy {
    host: Arc<dyn MethodHost>,
    method: String,
    original: Arc<dyn AsyncMethod>,
    installed: Arc<dyn AsyncMethod>,
    state: Arc<SpyState>,
    restored: AtomicBool,
}

impl Spy {
    pub fn install(
        host: Arc<dyn MethodHost>,
        method: &str,
        replacement: Arc<dyn AsyncMethod>,
    ) -> Result<Self, FixtureError> {
        let state = Arc::new(SpyState {
            calls: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });
        let installed: Arc<dyn AsyncMethod> = Arc::new(CountingMethod {
            inner: replacement,
            state: Arc::clone(&state),
        });
        let original = host
            .methods()
            .replace_checked(method, Arc::clone(&installed), |current| {
                if current.is_stub() {
                    Err(FixtureError::AlreadyWrapped {
                        method: method.to_string(),
                    })
                } else {
                    Ok(())
                }
            })?;
        Ok(Self {
            host,
            method: method.to_string(),
            original,
            installed,
            state,
            restored: AtomicBool::new(false),
        })
    }

    pub fn call_count(&self) -> u64 {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The method that occupied the slot before installation.
    pub fn original(&self) -> Arc<dyn AsyncMethod> {
        Arc::clone(&self.original)
    }

    pub fn is_installed(&self) -> bool {
        self.host.methods().is_same(&self.method, &self.installed)
    }

    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    /// Reinstalls the original. Only the first call does anything; returns
    /// whether this call did.
    pub fn restore(&self) -> bool {
        if self.restored.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.active.store(false, Ordering::SeqCst);
        // A slot someone else has since reassigned is left alone.
        let _ = self.host.methods().replace_checked(
            &self.method,
            Arc::clone(&self.original),
            |current| {
                if Arc::ptr_eq(current, &self.installed) {
                    Ok(())
                } else {
                    Err(FixtureError::AlreadyWrapped {
                        method: self.method.clone(),
                    })
                }
            },
        );
        true
    }
}
