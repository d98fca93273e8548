//! Shared state for the exporter server.

use std::sync::Arc;

use delpro_metrics::{HistoricalReplay, MetricSet};
use delpro_source::RecordSource;

use crate::config::ExporterConfig;

/// State shared by the HTTP handlers.
///
/// The live set is written by the live updater and read by `/metrics`;
/// historical requests only read from the source.
pub struct ExporterState {
    config: ExporterConfig,
    live: MetricSet,
    source: Arc<dyn RecordSource>,
    replay: HistoricalReplay,
}

impl std::fmt::Debug for ExporterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterState")
            .field("config", &self.config)
            .field("live_series", &self.live.len())
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

impl ExporterState {
    /// Create a new exporter state.
    #[must_use]
    pub fn new(config: ExporterConfig, live: MetricSet, source: Arc<dyn RecordSource>) -> Self {
        let replay = HistoricalReplay::new()
            .with_policy(config.bracket_policy)
            .with_bracket_offset(config.bracket_offset);
        Self {
            config,
            live,
            source,
            replay,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ExporterConfig {
        &self.config
    }

    /// Get the live metric set.
    #[must_use]
    pub const fn live(&self) -> &MetricSet {
        &self.live
    }

    /// Get the record source.
    #[must_use]
    pub fn source(&self) -> &dyn RecordSource {
        self.source.as_ref()
    }

    /// Get the historical replay settings.
    #[must_use]
    pub const fn replay(&self) -> &HistoricalReplay {
        &self.replay
    }
}
