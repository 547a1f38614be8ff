use std::path::PathBuf;

use tempo_runtime::CaptureError;

use crate::observer::ObserverKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot instrument target: {reason}")]
    InstrumentationTarget { reason: String },

    #[error("observer `{kind}` cannot accept updates: {reason}")]
    InvalidObserver { kind: ObserverKind, reason: String },

    #[error("observer `{0}` is not attached")]
    ObserverNotAttached(ObserverKind),

    #[error("execution wrapper returned without invoking the target")]
    TargetNotInvoked,

    #[error(transparent)]
    Insert(#[from] InsertFailure),

    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("no bundled writer for {url} -- use a sqlite:// or file:// connection url")]
    UnsupportedEngine { url: String },

    #[error("invalid configuration in {origin}: {reason}")]
    InvalidConfig { origin: String, reason: String },

    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// A storage collaborator rejected a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("insert into `{database}` failed: {reason}")]
pub struct InsertFailure {
    pub database: String,
    pub reason: String,
}

impl InsertFailure {
    pub fn new(database: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            database: database.into(),
            reason: reason.to_string(),
        }
    }
}
