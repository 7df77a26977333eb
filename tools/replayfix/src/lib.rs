//! Record/replay fixtures for callback-style async methods in tests.
//!
//! [`wrap`] swaps a named method on a target for a dispatcher that, per
//! [`Mode`], passes calls through (`live`), passes them through and records
//! each result to disk (`capture`), or answers from those recordings without
//! running the real method (`replay`). Recordings are keyed by test identity,
//! method name and the call's ordinal within the test.

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod fingerprint;
pub mod handle;
pub mod lifecycle;
pub mod logging;
pub mod method;
pub mod runtime;
pub mod sequencer;
pub mod store;
pub mod stub;
pub mod value;

pub use dispatcher::{MismatchPolicy, Mode};
pub use errors::FixtureError;
pub use handle::{wrap, FixtureStub, WrapOptions};
pub use lifecycle::{TestContext, TestScope};
pub use method::{call, method_fn, AsyncMethod, Callback, MethodHost, MethodTable, PendingCall};
pub use value::{ArgValue, CallOutcome};
