//! Error types for the harvester.
//!
//! Errors are grouped by the layer that raises them. The resilience layer and the
//! pipeline rely on [`HarvestError::is_retryable`] and [`HarvestError::is_cancelled`]
//! to decide whether a failure is retried, counted, or escalated.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the harvester.
#[derive(Debug, Error)]
pub enum HarvestError {
    // Upstream errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Upstream {source_name} returned HTTP {status}: {message}")]
    Upstream {
        source_name: String,
        status: u16,
        message: String,
    },

    #[error("Circuit breaker open for {source_name}")]
    CircuitBreakerOpen { source_name: String },

    // Persistence errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Record errors
    #[error("Mapping failed for record {external_id:?}: {message}")]
    Mapping {
        external_id: Option<String>,
        message: String,
    },

    // Run lifecycle errors
    #[error("Fetch run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Invalid run transition for {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Operation was cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

impl From<std::io::Error> for HarvestError {
    fn from(err: std::io::Error) -> Self {
        HarvestError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        HarvestError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        // Timeouts land in `Network` here; callers that know the configured
        // limit map them to `Timeout` themselves.
        if err.is_decode() {
            HarvestError::Json {
                message: err.to_string(),
                source: None,
            }
        } else {
            HarvestError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl HarvestError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HarvestError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a mapping error for a record.
    pub fn mapping(external_id: Option<&str>, message: impl Into<String>) -> Self {
        HarvestError::Mapping {
            external_id: external_id.map(str::to_string),
            message: message.into(),
        }
    }

    /// Check if this error is transient and should trigger a retry.
    ///
    /// Network failures, timeouts and HTTP 5xx are transient. HTTP 4xx and
    /// deserialization failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            HarvestError::Network { .. } | HarvestError::Timeout(_) => true,
            HarvestError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check if this error represents cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarvestError::Cancelled)
    }

    /// Check if this error is a SQLite unique/primary-key constraint violation.
    ///
    /// Foreign-key, NOT NULL and CHECK violations are not matched.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            HarvestError::Database {
                source: Some(rusqlite::Error::SqliteFailure(err, _)),
                ..
            } => matches!(
                err.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ),
            _ => false,
        }
    }

    /// Render the full source chain, used for `error_detail` on failed runs.
    pub fn detail(&self) -> String {
        let mut detail = format!("{:?}", self);
        let mut current = std::error::Error::source(self);
        while let Some(cause) = current {
            detail.push_str(&format!("\ncaused by: {}", cause));
            current = std::error::Error::source(cause);
        }
        detail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarvestError::RunNotFound {
            run_id: "abc".into(),
        };
        assert_eq!(err.to_string(), "Fetch run not found: abc");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(HarvestError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(HarvestError::Network {
            message: "reset".into(),
            cause: None
        }
        .is_retryable());
        assert!(HarvestError::Upstream {
            source_name: "models".into(),
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!HarvestError::Upstream {
            source_name: "models".into(),
            status: 404,
            message: "missing".into()
        }
        .is_retryable());
        assert!(!HarvestError::Json {
            message: "bad".into(),
            source: None
        }
        .is_retryable());
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(HarvestError::Cancelled.is_cancelled());
        assert!(!HarvestError::Cancelled.is_retryable());
    }

    fn sqlite_failure(extended_code: i32) -> HarvestError {
        HarvestError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(extended_code),
            None,
        ))
    }

    #[test]
    fn test_only_unique_violations_are_constraint_races() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE).is_constraint_violation());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY).is_constraint_violation());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY).is_constraint_violation());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL).is_constraint_violation());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT_CHECK).is_constraint_violation());
    }

    #[test]
    fn test_detail_includes_debug_form() {
        let err = HarvestError::Config {
            message: "missing base_url".into(),
        };
        assert!(err.detail().contains("missing base_url"));
    }
}
