use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by layout generation, backend interaction and persistence.
///
/// Only `Validation`, `UnknownSession`/`UnknownTab`, `UnsupportedBackend` and
/// `Persistence` are meant to escape to callers. The remaining variants describe
/// failed external commands; batch operations fold them into their result maps.
#[derive(Error, Debug)]
pub enum MuxError {
    /// Bad caller input (layout, tab, saved id) caught before any I/O happened.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backend (or helper) binary is not installed on the target host.
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// An external command did not finish within its timeout.
    #[error("command timed out after {}s: {command}", after.as_secs_f32())]
    Timeout { command: String, after: Duration },

    /// A backend command ran but reported failure.
    #[error("`{command}` exited with {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// The channel to a remote host could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// A saved manager directory or one of its files is missing or unreadable.
    #[error("persistence error at {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error("session '{0}' is not managed here")]
    UnknownSession(String),

    #[error("tab '{0}' is not part of the layout")]
    UnknownTab(String),

    #[error("backend '{backend}' cannot be used {reason}")]
    UnsupportedBackend {
        backend: &'static str,
        reason: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl MuxError {
    pub fn persistence(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Persistence {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly tag used in structured results and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MuxError::Validation(_) => "validation",
            MuxError::ExecutableNotFound(_) => "executable_not_found",
            MuxError::Timeout { .. } => "timeout",
            MuxError::CommandFailed { .. } => "command_failed",
            MuxError::Transport(_) => "transport",
            MuxError::Persistence { .. } => "persistence",
            MuxError::UnknownSession(_) => "unknown_session",
            MuxError::UnknownTab(_) => "unknown_tab",
            MuxError::UnsupportedBackend { .. } => "unsupported_backend",
            MuxError::Io(_) => "io",
            MuxError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
