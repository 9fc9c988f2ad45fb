/*!
Error types for the Stateward core engine.
*/

use std::time::Duration;
use stateward_retry::RetryableError;
use thiserror::Error;

/// Result type used throughout the Stateward core.
pub type Result<T> = std::result::Result<T, StatewardError>;

/// Errors that can occur while persisting, restoring or syncing state.
#[derive(Error, Debug)]
pub enum StatewardError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Primary tier database errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// A delegated job did not answer in time
    #[error("Compression job {job_id} timed out after {timeout:?}")]
    Timeout { job_id: String, timeout: Duration },

    /// The background compression context is gone or could not start
    #[error("Compression delegate unavailable: {0}")]
    DelegateUnavailable(String),

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Storage tier errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A whole tier could not be reached
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: &'static str, reason: String },

    /// Remote backend errors
    #[error("Remote error in '{collection}': {message}")]
    Remote {
        collection: String,
        message: String,
        transient: bool,
    },

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl StatewardError {
    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a tier-unavailable error
    pub fn tier_unavailable<S: Into<String>>(tier: &'static str, reason: S) -> Self {
        Self::TierUnavailable {
            tier,
            reason: reason.into(),
        }
    }

    /// Remote error worth retrying (network hiccup, backend overloaded)
    pub fn remote_transient<C: Into<String>, S: Into<String>>(collection: C, msg: S) -> Self {
        Self::Remote {
            collection: collection.into(),
            message: msg.into(),
            transient: true,
        }
    }

    /// Remote error that retrying will not fix (permission denied, bad query)
    pub fn remote_permanent<C: Into<String>, S: Into<String>>(collection: C, msg: S) -> Self {
        Self::Remote {
            collection: collection.into(),
            message: msg.into(),
            transient: false,
        }
    }

    /// Whether this error came from a delegate timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl RetryableError for StatewardError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Remote { transient, .. } => *transient,
            Self::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let error = StatewardError::validation("test validation error");
        assert_eq!(error.to_string(), "Validation error: test validation error");

        let error = StatewardError::compression("bad gzip header");
        assert_eq!(error.to_string(), "Compression error: bad gzip header");

        let error = StatewardError::tier_unavailable("primary", "table missing");
        assert_eq!(error.to_string(), "Tier primary unavailable: table missing");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = StatewardError::from(io_error);
        assert!(matches!(error, StatewardError::Io(_)));
    }

    #[test]
    fn test_timeout_error() {
        let error = StatewardError::Timeout {
            job_id: "job-1".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(error.is_timeout());
        assert!(error.to_string().contains("job-1"));
    }

    #[test]
    fn test_remote_error_classification() {
        assert!(StatewardError::remote_transient("tarefas", "unavailable").is_transient());
        assert!(StatewardError::remote_permanent("tarefas", "denied").is_permanent());
        assert!(!StatewardError::validation("nope").is_transient());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<StatewardError>();
        assert_sync::<StatewardError>();
    }
}
