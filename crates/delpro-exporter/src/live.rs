//! Periodic live updates of the shared metric set.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use delpro_metrics::{MetricEngine, MetricSet, MilkingRecord};
use delpro_source::{RecordQuery, RecordSource};

use crate::config::{window_start, ExporterConfig};
use crate::cursor::OidCursor;
use crate::error::{ExporterError, ExporterResult};

/// Outcome of one live update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Records applied in this cycle.
    pub records: usize,
    /// Cursor after the cycle.
    pub last_oid: i64,
}

/// Drives the shared live [`MetricSet`] from a record source.
///
/// Owns the OID cursor; nothing else mutates it.
pub struct LiveUpdater {
    source: Arc<dyn RecordSource>,
    engine: MetricEngine,
    cursor: OidCursor,
    interval: Duration,
    lookback: Duration,
    settle_delay: Duration,
    query_timeout: Duration,
}

impl std::fmt::Debug for LiveUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveUpdater")
            .field("cursor", &self.cursor)
            .field("interval", &self.interval)
            .field("lookback", &self.lookback)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

impl LiveUpdater {
    /// Creates an updater writing into `set`.
    pub fn new(
        source: Arc<dyn RecordSource>,
        set: MetricSet,
        cursor: OidCursor,
        config: &ExporterConfig,
    ) -> Self {
        Self {
            source,
            engine: MetricEngine::new(set),
            cursor,
            interval: config.update_interval,
            lookback: config.live_lookback,
            settle_delay: config.settle_delay,
            query_timeout: config.live_query_timeout,
        }
    }

    /// Returns the cursor.
    #[must_use]
    pub const fn cursor(&self) -> &OidCursor {
        &self.cursor
    }

    /// Raises the cursor to an operator-supplied floor.
    pub fn apply_floor(&mut self, floor: i64) -> bool {
        self.cursor.apply_floor(floor)
    }

    async fn fetch(&self, query: &RecordQuery) -> ExporterResult<Vec<MilkingRecord>> {
        timeout(self.query_timeout, self.source.query(query))
            .await
            .map_err(|_| ExporterError::Timeout(self.query_timeout.as_secs()))?
            .map_err(ExporterError::from)
    }

    /// Creates zero-valued accumulating series for every animal seen over
    /// the lookback window ending at `now`, so `increase()` has a baseline
    /// before the first live observation.
    ///
    /// Returns the number of label keys initialised.
    ///
    /// # Errors
    ///
    /// Returns an error if the source query fails or times out.
    pub async fn initialize_counters(&self, now: DateTime<Utc>) -> ExporterResult<usize> {
        info!("initializing counters for animals from the lookback window");
        let query = RecordQuery::new(window_start(now, self.lookback), now);
        let records = self.fetch(&query).await?;

        let mut seen = BTreeSet::new();
        for record in &records {
            if seen.insert(record.label_key()) {
                self.engine.initialize_series(record);
            }
        }
        info!(animals = seen.len(), "initialized counters");
        Ok(seen.len())
    }

    /// Runs one update cycle with the window ending `settle_delay` before `now`.
    ///
    /// Records above the cursor are applied to the shared set, the cursor is
    /// advanced to the highest OID seen and device utilisation is refreshed.
    /// A utilisation failure is logged and does not fail the cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the record query fails or times out; nothing is
    /// applied and the cursor does not move in that case.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> ExporterResult<CycleOutcome> {
        let end = window_start(now, self.settle_delay);
        let query = RecordQuery::new(window_start(end, self.lookback), end)
            .after_oid(self.cursor.last_oid());
        let records = self.fetch(&query).await?;

        self.engine.apply_all(&records)?;

        if let Some(highest) = records.iter().map(|r| r.oid).max() {
            if self.cursor.advance(highest) {
                info!(oid = highest, "updated last processed OID");
            }
        }
        debug!(records = records.len(), last_oid = self.cursor.last_oid(), "live update cycle");

        match timeout(self.query_timeout, self.source.device_utilization()).await {
            Ok(Ok(utilization)) => self.engine.apply_device_utilization(&utilization)?,
            Ok(Err(e)) => warn!(error = %e, "error collecting device utilization"),
            Err(_) => warn!(
                seconds = self.query_timeout.as_secs(),
                "device utilization query timed out"
            ),
        }

        Ok(CycleOutcome {
            records: records.len(),
            last_oid: self.cursor.last_oid(),
        })
    }

    /// Runs update cycles every interval until `shutdown` completes.
    ///
    /// The first cycle runs immediately. A failed cycle is logged and the
    /// loop waits for the next tick.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("live updater stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!(error = %e, "error collecting milking metrics");
                    }
                }
            }
        }
    }
}
