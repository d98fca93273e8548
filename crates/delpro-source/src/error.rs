//! Record source error types.

use thiserror::Error;

/// Errors returned by record sources.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The database could not be reached or refused the session.
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// A query failed on the server side.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// The operation did not complete in time.
    #[error("operation timed out after {seconds} seconds")]
    Timeout {
        /// Timeout duration in seconds.
        seconds: u64,
    },

    /// A row could not be turned into a record.
    #[error("failed to decode row: {0}")]
    Decode(String),

    /// Invalid source configuration.
    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),
}

impl SourceError {
    /// Returns true for failures that may succeed on a later attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::QueryFailed(_) | Self::Timeout { .. }
        )
    }
}

impl From<tiberius::error::Error> for SourceError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Io { .. } | tiberius::error::Error::Routing { .. } => {
                Self::ConnectionFailed(err.to_string())
            }
            tiberius::error::Error::Conversion(_) => Self::Decode(err.to_string()),
            _ => Self::QueryFailed(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}

/// Result type for record source operations.
pub type Result<T> = std::result::Result<T, SourceError>;
