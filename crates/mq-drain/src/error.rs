//! Error types for the migration library.

use thiserror::Error;

/// Main error type for drain operations.
#[derive(Error, Debug)]
pub enum DrainError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The source broker's management interface cannot be queried.
    ///
    /// Fatal to the whole run: without visibility into the broker there
    /// is no safe way to enumerate what still has to be migrated.
    #[error("Management interface unavailable: {message}")]
    DirectoryUnavailable { message: String },

    /// The target broker could not be reached during the startup probe.
    #[error("Cannot connect to target broker [{url}]: {message}")]
    ConnectivityCheckFailed { url: String, message: String },

    /// Transfer failed for a single destination; the run continues.
    #[error("Transfer failed for destination {destination}: {message}")]
    Transfer {
        destination: String,
        message: String,
    },

    /// Two-phase commit could not complete; the transaction rolled back.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// Transaction coordinator misuse (begin while active, commit without begin).
    #[error("Transaction state error: {0}")]
    Transaction(String),

    /// Broker client protocol error (connect, session, consume, produce).
    #[error("Broker error: {0}")]
    Broker(String),

    /// IO error (decision log, file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl DrainError {
    /// Create a DirectoryUnavailable error.
    pub fn directory(message: impl Into<String>) -> Self {
        DrainError::DirectoryUnavailable {
            message: message.into(),
        }
    }

    /// Create a Transfer error.
    pub fn transfer(destination: impl Into<String>, message: impl Into<String>) -> Self {
        DrainError::Transfer {
            destination: destination.into(),
            message: message.into(),
        }
    }

    /// Create a Broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        DrainError::Broker(message.into())
    }

    /// Process exit code for this error at the CLI boundary.
    pub fn exit_code(&self) -> u8 {
        match self {
            DrainError::Config(_) | DrainError::Yaml(_) => 2,
            DrainError::ConnectivityCheckFailed { .. } => 3,
            DrainError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for drain operations.
pub type Result<T> = std::result::Result<T, DrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_includes_destination() {
        let err = DrainError::transfer("ORDERS", "connection reset");
        assert!(err.to_string().contains("ORDERS"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(DrainError::Config("bad".into()).exit_code(), 2);
        assert_eq!(
            DrainError::ConnectivityCheckFailed {
                url: "mem://x".into(),
                message: "down".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(DrainError::Cancelled.exit_code(), 130);
        assert_eq!(DrainError::broker("boom").exit_code(), 1);
    }
}
