//! Error types for treepatch

use thiserror::Error;

/// Result type alias for treepatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the patch engine
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem or stream failure, wrapped with the operation that failed
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A recognized signature or patch whose payload is corrupt or truncated
    #[error("decode error in {context}: {message}")]
    Decode { context: String, message: String },

    /// Reconstructed data disagrees with what the patch or signature declares
    #[error("integrity error at {path}: {message}")]
    Integrity { path: String, message: String },

    /// Invalid parameters, reported before any work is done
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an I/O error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a decode error for a recognized but unusable stream
    pub fn decode(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create an integrity error naming the affected entry
    pub fn integrity(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if this error reports bad reconstructed data
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity { .. })
    }
}
