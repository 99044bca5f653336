use thiserror::Error;

use crate::value::Record;

/// Errors surfaced by the local table store, the operation log and the sync
/// context. Variants line up with the error kinds a caller needs to branch
/// on: bad input, a precondition the caller should have checked, storage
/// failure, and the two flavors of remote failure (transport vs. conflict).
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{table}/{id}: not found")]
    NotFound { table: String, id: String },

    #[error("sqlite: {0}")]
    StoreIo(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("transport error (status {status}): {message}")]
    Transport { status: u16, message: String },

    /// A push attempt hit a version conflict (HTTP 412, or a server-reported
    /// version mismatch) that no registered handler resolved.
    #[error("conflict on {table}/{id}")]
    Conflict {
        table: String,
        id: String,
        server_record: Option<Record>,
    },

    /// A push-error-controller verb was invoked on an op that had already
    /// been resolved once.
    #[error("push error already resolved for {table}/{id}")]
    AlreadyResolved { table: String, id: String },
}

impl SyncError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        SyncError::Precondition(msg.into())
    }
}
