//! Error taxonomy for the notification bridge

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by watch setup, teardown and the notification thread
#[derive(Debug, Error)]
pub enum WatchError {
    /// Thread, lock or semaphore creation failed
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The watched path could not be resolved to an absolute, symlink-free form
    #[error("cannot resolve watched path {}: {source}", path.display())]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation not valid in the handle's (or run loop's) current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The native notification facility is unavailable on this platform
    #[error("native filesystem notifications are not supported on this system")]
    SystemNotSupported,

    /// A queue could not grow to hold a new item
    #[error("out of memory while queueing {0}")]
    OutOfMemory(&'static str),

    /// The native facility rejected a request
    #[error("notification backend error: {0}")]
    Backend(String),

    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        WatchError::Backend(err.to_string())
    }
}

/// Result type for watcher operations
pub type Result<T> = std::result::Result<T, WatchError>;
