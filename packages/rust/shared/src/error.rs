//! Error types for docsink.
//!
//! Library crates use [`DocsinkError`] via `thiserror`.
//! The CLI app wraps this with `color-eyre` for rich diagnostics.
//!
//! Cancellation is modeled as the dedicated [`DocsinkError::Cancelled`]
//! variant rather than a generic failure, so every layer can tell a
//! cancelled unit of work apart from a broken one.

use std::path::PathBuf;

/// Top-level error type for all docsink operations.
#[derive(Debug, thiserror::Error)]
pub enum DocsinkError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error during fetch or download.
    #[error("network error: {0}")]
    Network(String),

    /// HTML parsing or content extraction error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Object-storage (bucket) error, with the HTTP status when known.
    #[error("object store error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    ObjectStore { status: Option<u16>, message: String },

    /// Image decode/transcode error.
    #[error("image error: {0}")]
    Image(String),

    /// Data validation error (invariant violation, invalid input).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Cooperative cancellation was observed. Not a failure.
    #[error("operation cancelled")]
    Cancelled,

    /// A job in a terminal state rejected a lifecycle operation.
    #[error("job already finished with status {status}")]
    JobFinished { status: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocsinkError>;

impl DocsinkError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an object-store error carrying the response status.
    pub fn object_store(status: impl Into<Option<u16>>, msg: impl Into<String>) -> Self {
        Self::ObjectStore {
            status: status.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this is an object-store permission denial (triggers the
    /// authenticated upload fallback).
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::ObjectStore {
                status: Some(401 | 403),
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DocsinkError::config("missing storage endpoint");
        assert_eq!(err.to_string(), "config error: missing storage endpoint");

        let err = DocsinkError::object_store(403, "row-level security");
        assert!(err.to_string().contains("HTTP 403"));
    }

    #[test]
    fn permission_denied_detection() {
        assert!(DocsinkError::object_store(403, "denied").is_permission_denied());
        assert!(DocsinkError::object_store(401, "denied").is_permission_denied());
        assert!(!DocsinkError::object_store(500, "boom").is_permission_denied());
        assert!(!DocsinkError::object_store(None, "no status").is_permission_denied());
    }

    #[test]
    fn cancelled_is_distinguishable() {
        assert!(DocsinkError::Cancelled.is_cancelled());
        assert!(!DocsinkError::Network("timeout".into()).is_cancelled());
    }
}
