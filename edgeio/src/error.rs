use std::io;

use thiserror::Error;

/// Errors returned by the watcher.
///
/// Submission calls fail synchronously with one of the rejection variants;
/// everything else is delivered through [`OpResult::err`](crate::OpResult).
#[derive(Debug, Error)]
pub enum Error {
    /// The connection handle does not expose a usable raw descriptor.
    #[error("unsupported connection handle")]
    Unsupported,
    /// The connection does not implement raw-descriptor access. Retained as
    /// a distinct identity; submissions report [`Error::Unsupported`]
    /// instead.
    #[error("connection does not expose a raw descriptor")]
    NoRawConn,
    /// The watcher has shut down (or shutdown began before the call).
    #[error("watcher closed")]
    WatcherClosed,
    /// The connection was released (freed, errored, or reached EOF).
    #[error("connection closed")]
    ConnClosed,
    /// The operation exceeded its deadline before completing.
    #[error("operation exceeded deadline")]
    Deadline,
    /// A write was submitted with an empty buffer.
    #[error("empty buffer")]
    EmptyBuffer,
    /// Kernel error from the transfer or from descriptor setup.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is a deadline expiration.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::Deadline)
    }

    /// The OS error code, when the error carries one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
