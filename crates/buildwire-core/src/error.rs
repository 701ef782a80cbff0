//! Error types for the buildwire server.
//!
//! These errors cover server startup, transports, watching and the build
//! system boundary. Client-facing failures never surface as `ServerError`:
//! they are turned into error responses at the request boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the buildwire server.
#[derive(Debug, Error)]
pub enum ServerError {
    // Startup errors
    #[error("No protocols defined.")]
    NoProtocols,

    #[error("Server was already started.")]
    AlreadyServed,

    #[error("Internal Error with {endpoint}: {message}")]
    Bind { endpoint: String, message: String },

    #[error("Internal Error listening on {endpoint}: {message}")]
    Listen { endpoint: String, message: String },

    #[error("Internal Error: Event loop stopped in unclean state ({pending} handles still open).")]
    UncleanShutdown { pending: usize },

    // Transport errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // File watching errors
    #[error("Failed to watch {path}: {message}")]
    Watch { path: PathBuf, message: String },

    // Build system errors
    #[error("Build system error: {message}")]
    BuildSystem { message: String },
}

/// Result type alias for buildwire operations.
pub type Result<T> = std::result::Result<T, ServerError>;

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<notify::Error> for ServerError {
    fn from(err: notify::Error) -> Self {
        ServerError::Watch {
            path: err.paths.first().cloned().unwrap_or_default(),
            message: err.to_string(),
        }
    }
}

impl ServerError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ServerError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error prevented the server from starting at all.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            ServerError::NoProtocols
                | ServerError::AlreadyServed
                | ServerError::Bind { .. }
                | ServerError::Listen { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::Bind {
            endpoint: "/tmp/buildwire.sock".into(),
            message: "address in use".into(),
        };
        assert_eq!(
            err.to_string(),
            "Internal Error with /tmp/buildwire.sock: address in use"
        );
        assert_eq!(ServerError::NoProtocols.to_string(), "No protocols defined.");
    }

    #[test]
    fn test_startup_failures() {
        assert!(ServerError::NoProtocols.is_startup_failure());
        assert!(ServerError::Listen {
            endpoint: "x".into(),
            message: "y".into()
        }
        .is_startup_failure());
        assert!(!ServerError::UncleanShutdown { pending: 1 }.is_startup_failure());
    }

    #[test]
    fn test_io_conversion_keeps_source() {
        let err: ServerError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        match err {
            ServerError::Io { source, path, .. } => {
                assert!(source.is_some());
                assert!(path.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
