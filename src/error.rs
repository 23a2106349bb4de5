//! Errors that travel inside an ERROR frame

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// The requested name does not exist under the served root
    NotFound,
    /// The request named something outside the root or otherwise unusable
    InvalidArgument,
    /// Filesystem failure on the producing side
    Io,
    /// Malformed or unexpected frames
    Protocol,
    /// The caller's cancellation token fired
    Cancelled,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::NotFound => "not found",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::Io => "io error",
            StatusCode::Protocol => "protocol error",
            StatusCode::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A stream-level failure. Aborts one remote call, never the connection setup.
#[derive(Serialize, Deserialize, thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: StatusCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "call cancelled")
    }

    /// Classify a local I/O failure the way the server reports it
    pub fn from_io(err: &std::io::Error, what: &str) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => StatusCode::NotFound,
            _ => StatusCode::Io,
        };
        Self::new(code, format!("{}: {}", what, err))
    }
}

/// Status code of an `anyhow` chain, if it carries a `RemoteError`
pub fn status_of(err: &anyhow::Error) -> Option<StatusCode> {
    err.downcast_ref::<RemoteError>().map(|e| e.code)
}
