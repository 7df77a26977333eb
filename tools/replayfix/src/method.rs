//! Callback-style async methods and the named slots they live in.
//!
//! A target object exposes a [`MethodTable`]; each slot holds one
//! [`AsyncMethod`]. Wrapping swaps the slot's method, restoring swaps it back.
//! [`call`] adapts the callback contract to a `tokio::sync::oneshot` future.

use crate::errors::FixtureError;
use crate::value::{ArgValue, CallOutcome};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Completion continuation. Invoked at most once.
pub type Callback = Box<dyn FnOnce(CallOutcome) + Send + 'static>;

pub trait AsyncMethod: Send + Sync {
    /// Start the call. Completion is reported through `callback`; an `Err`
    /// return means the call never started and `callback` was dropped.
    fn call(&self, args: Vec<ArgValue>, callback: Callback) -> Result<(), FixtureError>;

    /// True for wrappers installed by a stubber.
    fn is_stub(&self) -> bool {
        false
    }
}

struct FnMethod<F>(F);

impl<F> AsyncMethod for FnMethod<F>
where
    F: Fn(Vec<ArgValue>, Callback) -> Result<(), FixtureError> + Send + Sync,
{
    fn call(&self, args: Vec<ArgValue>, callback: Callback) -> Result<(), FixtureError> {
        (self.0)(args, callback)
    }
}

pub fn method_fn<F>(f: F) -> Arc<dyn AsyncMethod>
where
    F: Fn(Vec<ArgValue>, Callback) -> Result<(), FixtureError> + Send + Sync + 'static,
{
    Arc::new(FnMethod(f))
}

#[derive(Default)]
pub struct MethodTable {
    slots: Mutex<HashMap<String, Arc<dyn AsyncMethod>>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: impl Into<String>, method: Arc<dyn AsyncMethod>) {
        self.slots
            .lock()
            .expect("method slots lock")
            .insert(name.into(), method);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AsyncMethod>> {
        self.slots
            .lock()
            .expect("method slots lock")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots
            .lock()
            .expect("method slots lock")
            .contains_key(name)
    }

    /// Swaps the method in an existing slot, returning the previous one.
    pub fn replace(
        &self,
        name: &str,
        method: Arc<dyn AsyncMethod>,
    ) -> Result<Arc<dyn AsyncMethod>, FixtureError> {
        self.replace_checked(name, method, |_| Ok(()))
    }

    /// `replace`, but only if `check` accepts the current occupant. The check
    /// and the swap happen under one lock.
    pub fn replace_checked<F>(
        &self,
        name: &str,
        method: Arc<dyn AsyncMethod>,
        check: F,
    ) -> Result<Arc<dyn AsyncMethod>, FixtureError>
    where
        F: FnOnce(&Arc<dyn AsyncMethod>) -> Result<(), FixtureError>,
    {
        let mut slots = self.slots.lock().expect("method slots lock");
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| FixtureError::MethodNotFound {
                method: name.to_string(),
            })?;
        check(slot)?;
        Ok(std::mem::replace(slot, method))
    }

    pub fn is_same(&self, name: &str, method: &Arc<dyn AsyncMethod>) -> bool {
        self.get(name)
            .is_some_and(|current| Arc::ptr_eq(&current, method))
    }
}

/// An object whose methods can be looked up and swapped by name.
pub trait MethodHost: Send + Sync {
    fn methods(&self) -> &MethodTable;

    /// Dispatches through whatever currently occupies the slot. The slot lock
    /// is not held while the method runs.
    fn invoke(
        &self,
        name: &str,
        args: Vec<ArgValue>,
        callback: Callback,
    ) -> Result<(), FixtureError> {
        let method = self
            .methods()
            .get(name)
            .ok_or_else(|| FixtureError::MethodNotFound {
                method: name.to_string(),
            })?;
        method.call(args, callback)
    }
}

impl MethodHost for MethodTable {
    fn methods(&self) -> &MethodTable {
        self
    }
}

/// Invoke `name` and receive its outcome as a future.
pub fn call(
    host: &dyn MethodHost,
    name: &str,
    args: Vec<ArgValue>,
) -> Result<PendingCall, FixtureError> {
    let (tx, rx) = oneshot::channel();
    host.invoke(
        name,
        args,
        Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }),
    )?;
    Ok(PendingCall {
        method: name.to_string(),
        rx,
    })
}

/// Outcome of a started call. Resolves to `Abandoned` if the callback is
/// dropped without being invoked.
pub struct PendingCall {
    method: String,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    /// Blocks the current thread. Do not use inside an async runtime.
    pub fn wait(self) -> Result<CallOutcome, FixtureError> {
        let method = self.method;
        self.rx.blocking_recv().map_err(|_| abandoned(&method))
    }

    /// `None` while the callback has not fired yet.
    pub fn try_outcome(&mut self) -> Option<Result<CallOutcome, FixtureError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(Ok(outcome)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(abandoned(&self.method))),
        }
    }
}

impl Future for PendingCall {
    type Output = Result<CallOutcome, FixtureError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|res| res.map_err(|_| abandoned(&this.method)))
    }
}

fn abandoned(method: &str) -> FixtureError {
    FixtureError::Abandoned(format!("`{method}` dropped its callback"))
}
