//! Error types shared by the replicator, the client and the handlers.

use std::io;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while publishing, fetching or installing revisions
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The session id is unknown or the session outlived the expiration threshold.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// A revision file-list invariant was violated by the producer.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Incompatible revision: expected {expected}, found {found}")]
    IncompatibleRevision { expected: String, found: String },

    /// The install succeeded and is durable, only the notification failed.
    #[error("Commit callback failed: {0}")]
    CommitCallback(#[source] io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ReplicationError {
    /// Whether retrying (with a fresh session) may succeed.
    ///
    /// Transient I/O failures and expired sessions are expected to clear up
    /// on the next cycle. Everything else points at a misbehaving producer or
    /// a caller bug and must not be retried blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::SessionExpired(_))
    }

    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
