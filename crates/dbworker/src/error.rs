//! Error types shared by the parent-side connection and the worker executor.

use std::io;

/// Error surfaced to callers of a [`Connection`](crate::Connection).
///
/// `Clone` because a single terminal error fails every request still queued
/// when the connection dies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// The worker reported a failure for this request (bad SQL, constraint
    /// violation, ...). The connection stays usable unless the operation is
    /// fatal.
    #[error("{0}")]
    Backend(String),

    #[error("timeout")]
    Timeout,

    #[error("unexpected end-of-file while talking to database worker")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("failed to spawn database worker: {0}")]
    Spawn(String),

    /// The connection was closed explicitly, or dropped before the request
    /// could complete.
    #[error("connection closed")]
    Closed,
}

impl DbError {
    /// Whether this error can only be produced by a dead connection.
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, Self::Backend(_))
    }
}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<SpawnError> for DbError {
    fn from(e: SpawnError) -> Self {
        Self::Spawn(e.to_string())
    }
}

/// Failure reported by a [`Backend`](crate::worker::Backend).
///
/// Converted into a failure frame by the executor; never terminates the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::new("database handle not connected")
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Unrecoverable executor failure. The worker process exits on any of these.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("channel error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create channel: {0}")]
    Channel(#[source] io::Error),

    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),

    #[error("fork failed: {0}")]
    Fork(#[from] nix::Error),

    #[error("executor program not found: {0}")]
    ProgramNotFound(String),
}
