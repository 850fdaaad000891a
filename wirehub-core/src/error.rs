//! Domain-specific error types for wirehub.
//!
//! All fallible operations return `Result<T, WireError>`. Per-message
//! failures are converted into optional replies by the adaptor, so most
//! of these only surface through an awaited completion signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The canonical error type for wirehub.
#[derive(Debug, Error)]
pub enum WireError {
    // ── Codec Errors ─────────────────────────────────────────────
    /// A whole buffer could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A decoded value could not be encoded back to bytes.
    #[error("encode error: {0}")]
    Encode(String),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary record (de)serialization failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Action Errors ────────────────────────────────────────────
    /// An action failed while handling one message.
    #[error("action failed: {0}")]
    Action(String),

    /// A requester does not declare the called method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed while requests were outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// A channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Scheduler Errors ─────────────────────────────────────────
    /// A correlation future already exists for this request id.
    #[error("request id {0} already has a pending future")]
    DuplicateRequest(String),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The work was cancelled during shutdown.
    #[error("cancelled")]
    Cancelled,

    // ── File Errors ──────────────────────────────────────────────
    /// Writes were submitted to a file that is closing or closed.
    #[error("file {} is closed", .0.display())]
    FileClosed(PathBuf),

    /// A batched write failed; every caller in the batch sees the same cause.
    #[error("write to {} failed: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    // ── Server Errors ────────────────────────────────────────────
    /// `serve` was called on a server that is already running.
    #[error("server already started")]
    ServerAlreadyStarted,

    /// An operation required a running server.
    #[error("server not started")]
    ServerNotStarted,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WireError>;

// ── Convenient From implementations ──────────────────────────────

impl From<String> for WireError {
    fn from(s: String) -> Self {
        WireError::Other(s)
    }
}

impl From<&str> for WireError {
    fn from(s: &str) -> Self {
        WireError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WireError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        WireError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for WireError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        WireError::Encoding(e.to_string())
    }
}

impl From<tokio::task::JoinError> for WireError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            WireError::Cancelled
        } else {
            WireError::Other(format!("task panicked: {e}"))
        }
    }
}
