//! Error taxonomy shared by the Rust API and the C boundary.
//!
//! Every fallible operation reports one of these classes. Reasons carry the
//! OS or stderr text verbatim so the host can show something actionable.

use std::path::PathBuf;

use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failure classes reported by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The name is known to neither the in-process registry nor the OS.
    #[error("service not found: {name}")]
    NotFound { name: String },

    /// A service with this name is already registered under different paths.
    #[error("service already exists: {name}")]
    AlreadyExists { name: String },

    #[error("failed to start {name}: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("failed to stop {name}: {reason}")]
    StopFailed { name: String, reason: String },

    /// A configuration artifact could not be persisted.
    #[error("failed to write {}: {reason}", path.display())]
    WriteError { path: PathBuf, reason: String },

    /// Credential check failed before anything was touched.
    #[error("unauthorized: credential rejected")]
    Unauthorized,

    #[error("unknown action: {action}")]
    UnknownAction { action: String },

    /// An OS call outlived the internal deadline.
    #[error("timed out: {operation}")]
    Timeout { operation: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl BridgeError {
    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        BridgeError::Internal {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(name: &str) -> Self {
        BridgeError::NotFound {
            name: name.to_string(),
        }
    }

    pub(crate) fn start_failed(name: &str, reason: impl Into<String>) -> Self {
        BridgeError::StartFailed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn stop_failed(name: &str, reason: impl Into<String>) -> Self {
        BridgeError::StopFailed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn write_error(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BridgeError::WriteError {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
