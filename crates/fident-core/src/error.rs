use thiserror::Error;

use crate::record::Status;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Identifier output that cannot be turned into a record. Fatal for that one file only.
    #[error("malformed identifier output for {path}: {reason}")]
    MalformedRecord { path: String, reason: String },

    /// Bad policy entry. Fatal at load time, before any file is touched.
    #[error("invalid policy for {format}: {reason}")]
    PolicyValidation { format: String, reason: String },

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: Status, to: Status },

    #[error("{tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn policy(format: &str, reason: impl Into<String>) -> Self {
        Error::PolicyValidation {
            format: format.to_string(),
            reason: reason.into(),
        }
    }

    pub fn tool(tool: &str, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}
