//! Error types for the exporter.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use delpro_metrics::MetricsError;
use delpro_source::SourceError;

/// Result type alias for exporter operations.
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Errors that can occur in the exporter.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(std::net::SocketAddr, std::io::Error),

    /// Invalid request parameters.
    #[error("{0}")]
    BadRequest(String),

    /// The record source failed.
    #[error("record source error: {0}")]
    Source(#[from] SourceError),

    /// The record source did not answer in time.
    #[error("record source timed out after {0} seconds")]
    Timeout(u64),

    /// Metric generation or encoding failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Reading or writing the OID checkpoint failed.
    #[error("checkpoint I/O error on {path}: {source}")]
    Checkpoint {
        /// Checkpoint file path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ExporterError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason).into_response(),
            other => {
                error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
