use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixtureError {
    #[error(
        "missing fixture for test `{test}`, method `{method}`, call #{ordinal} (expected at {path})"
    )]
    MissingFixture {
        test: String,
        method: String,
        ordinal: u64,
        path: String,
    },
    #[error("fingerprint mismatch for test `{test}`, method `{method}`, call #{ordinal}")]
    FingerprintMismatch {
        test: String,
        method: String,
        ordinal: u64,
    },
    #[error("fixture storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("target has no method named `{method}`")]
    MethodNotFound { method: String },
    #[error("method `{method}` is already wrapped; restore the existing stub first")]
    AlreadyWrapped { method: String },
    #[error("no test is active; call TestContext::begin_test first")]
    NoActiveTest,
    #[error("call abandoned before completion: {0}")]
    Abandoned(String),
}
