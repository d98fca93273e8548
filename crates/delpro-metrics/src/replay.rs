//! Historical replay with counter-reset bracketing.
//!
//! Records are partitioned by label key and each partition is replayed into
//! its own fresh [`MetricSet`], so counters start at zero and only accumulate
//! that partition's history. Each partition is enclosed in synthetic
//! zero-valued points so `rate()` and `increase()` see a reset instead of a
//! jump when the series is imported next to older data.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use tracing::debug;

use crate::engine::MetricEngine;
use crate::error::Result;
use crate::exposition::write_timestamped;
use crate::model::{LabelKey, MilkingRecord};
use crate::registry::MetricSet;

/// Default distance between a bracket point and the nearest real record.
pub const DEFAULT_BRACKET_OFFSET: Duration = Duration::from_secs(10 * 60);

/// Where synthetic zero points are emitted around a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BracketPolicy {
    /// Only before the earliest record.
    Leading,
    /// Before the earliest and after the latest record.
    #[default]
    Both,
}

/// Outcome of one replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    /// Records replayed.
    pub records: usize,
    /// Partitions written.
    pub partitions: usize,
    /// Highest OID among the replayed records.
    pub highest_oid: Option<i64>,
}

/// Replays a window of records as a timestamped exposition stream.
#[derive(Debug, Clone)]
pub struct HistoricalReplay {
    policy: BracketPolicy,
    bracket_offset: Duration,
}

impl Default for HistoricalReplay {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoricalReplay {
    /// Creates a replay with both-ends bracketing at the default offset.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            policy: BracketPolicy::Both,
            bracket_offset: DEFAULT_BRACKET_OFFSET,
        }
    }

    /// Sets the bracket policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: BracketPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the bracket offset.
    #[must_use]
    pub const fn with_bracket_offset(mut self, offset: Duration) -> Self {
        self.bracket_offset = offset;
        self
    }

    /// Returns the bracket policy.
    #[must_use]
    pub const fn policy(&self) -> BracketPolicy {
        self.policy
    }

    const fn offset_millis(&self) -> i64 {
        self.bracket_offset.as_millis() as i64
    }

    /// Writes the replay of `records` to `out`.
    ///
    /// Partitions are written in label-key order; within a partition records
    /// are replayed in ascending OID order. An empty input writes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric update or the writer fails. Output already
    /// written is not retracted.
    pub fn write<W: Write + ?Sized>(
        &self,
        records: &[MilkingRecord],
        out: &mut W,
    ) -> Result<ReplaySummary> {
        let partitions = partition(records);
        let offset = self.offset_millis();

        for (key, partition) in &partitions {
            let times = partition.iter().map(|r| r.end_timestamp_millis());
            let (Some(earliest), Some(latest)) = (times.clone().min(), times.max()) else {
                continue;
            };
            let Some(first) = partition.first() else {
                continue;
            };

            let bracket = MetricEngine::new(MetricSet::new());
            bracket.initialize_series(first);
            write_timestamped(bracket.set(), out, earliest - offset)?;

            let engine = MetricEngine::new(MetricSet::new());
            for record in partition {
                engine.write_record(record, out)?;
            }

            if self.policy == BracketPolicy::Both {
                write_timestamped(bracket.set(), out, latest + offset)?;
            }
            debug!(partition = %key, records = partition.len(), "replayed partition");
        }

        Ok(ReplaySummary {
            records: records.len(),
            partitions: partitions.len(),
            highest_oid: highest_oid(records),
        })
    }
}

/// Groups records by label key, each group sorted by ascending OID.
#[must_use]
pub fn partition(records: &[MilkingRecord]) -> BTreeMap<LabelKey, Vec<&MilkingRecord>> {
    let mut partitions: BTreeMap<LabelKey, Vec<&MilkingRecord>> = BTreeMap::new();
    for record in records {
        partitions.entry(record.label_key()).or_default().push(record);
    }
    for partition in partitions.values_mut() {
        partition.sort_by_key(|r| r.oid);
    }
    partitions
}

/// Returns the highest OID among `records`.
#[must_use]
pub fn highest_oid(records: &[MilkingRecord]) -> Option<i64> {
    records.iter().map(|r| r.oid).max()
}
