//! Result and error types for the harness.

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can occur while orchestrating a run
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Configuration is missing or inconsistent
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// A `%package/...` path named a package nobody registered
    #[error("Cannot resolve {path}: unknown package '{package}'")]
    UnknownPackage {
        /// Package name
        package: String,
        /// Path that was being resolved
        path: String,
    },

    /// A path could not be resolved for another reason
    #[error("Cannot resolve path {path}: {message}")]
    PathResolution {
        /// Path that was being resolved
        path: String,
        /// Error message
        message: String,
    },

    /// Priority constraints could not be satisfied
    #[error("Priority error: {message}")]
    Priority {
        /// Error message
        message: String,
    },

    /// Instrumenting one source directory failed
    #[error("Instrumentation of '{directory}' failed: {message}")]
    Instrumentation {
        /// Name of the source directory definition
        directory: String,
        /// Error message
        message: String,
    },

    /// The content server could not bind its port
    #[error("Failed to bind content server to {addr}: {source}")]
    ServerBind {
        /// Address we tried to bind
        addr: SocketAddr,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The content server failed after binding
    #[error("Content server error: {message}")]
    Server {
        /// Error message
        message: String,
    },

    /// Report generation failed
    #[error("Report generation failed: {message}")]
    Report {
        /// Error message
        message: String,
    },

    /// Fixture error (start/stop failed)
    #[error("Fixture error: {message}")]
    Fixture {
        /// Error message
        message: String,
    },

    /// Operation called in the wrong state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Error message
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        ms: u64,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl HarnessError {
    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a priority error
    #[must_use]
    pub fn priority(message: impl Into<String>) -> Self {
        Self::Priority {
            message: message.into(),
        }
    }

    /// Create an instrumentation error for a named source directory
    #[must_use]
    pub fn instrumentation(directory: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instrumentation {
            directory: directory.into(),
            message: message.into(),
        }
    }

    /// Create a report error
    #[must_use]
    pub fn report(message: impl Into<String>) -> Self {
        Self::Report {
            message: message.into(),
        }
    }

    /// Create a fixture error
    #[must_use]
    pub fn fixture(message: impl Into<String>) -> Self {
        Self::Fixture {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// True for failures that must abort startup rather than be absorbed
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Instrumentation { .. } | Self::ServerBind { .. } | Self::Config { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_instrumentation_error_names_directory() {
        let err = HarnessError::instrumentation("src", "parse error in foo.js");
        let msg = err.to_string();
        assert!(msg.contains("'src'"));
        assert!(msg.contains("parse error"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_package_message() {
        let err = HarnessError::UnknownPackage {
            package: "nope".to_string(),
            path: "%nope/src".to_string(),
        };
        assert!(err.to_string().contains("unknown package 'nope'"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_bind_error_is_fatal() {
        let err = HarnessError::ServerBind {
            addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("127.0.0.1:7000"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HarnessError = io_err.into();
        assert!(err.to_string().contains("I/O"));
    }

    #[test]
    fn test_timeout_message() {
        let err = HarnessError::Timeout { ms: 30_000 };
        assert_eq!(err.to_string(), "Operation timed out after 30000ms");
    }
}
