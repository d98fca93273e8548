//! Error types for the delpro-metrics crate.

use thiserror::Error;

use crate::model::MetricKind;

/// Errors that can occur while updating or encoding metrics.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// An update was applied to a series of a different kind.
    #[error("metric {metric} is a {actual}, cannot update it as a {expected}")]
    KindMismatch {
        /// The metric name.
        metric: &'static str,
        /// The kind the update expected.
        expected: MetricKind,
        /// The kind of the catalog entry.
        actual: MetricKind,
    },

    /// Encoding the registry failed.
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] std::fmt::Error),

    /// Writing exposition output failed.
    #[error("failed to write exposition output: {0}")]
    Write(#[from] std::io::Error),
}

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;
