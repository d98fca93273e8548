//! Metric generation engine.
//!
//! Turns milking records into [`MetricSet`] updates. Every record goes through
//! the same fixed sequence of updates; metrics derived from an absent optional
//! field are skipped for that record.
//!
//! Updates are cumulative and deliberately not idempotent: applying a record
//! twice counts it twice. Callers keep a cursor to avoid that.

use std::collections::BTreeMap;
use std::io::Write;

use tracing::debug;

use crate::error::Result;
use crate::exposition::write_timestamped;
use crate::model::{LabelKey, Metric, MilkingRecord, TeatSet};
use crate::registry::{MetricSet, SeriesKey};

/// Applies milking records to a target metric set.
///
/// The set is injected so callers decide between the shared live set and an
/// isolated per-replay set.
#[derive(Debug, Clone)]
pub struct MetricEngine {
    set: MetricSet,
}

impl MetricEngine {
    /// Creates an engine writing into the given set.
    #[must_use]
    pub const fn new(set: MetricSet) -> Self {
        Self { set }
    }

    /// Returns the target set.
    #[must_use]
    pub const fn set(&self) -> &MetricSet {
        &self.set
    }

    /// Applies one record to the target set.
    ///
    /// # Errors
    ///
    /// Returns an error only if a catalog entry is updated as the wrong kind.
    pub fn apply(&self, record: &MilkingRecord) -> Result<()> {
        let labels = record.label_key();
        let end_secs = record.end_time.timestamp() as f64;
        let set = &self.set;

        set.inc_counter(&labels.series(Metric::MilkSessions))?;

        set.set_gauge(&labels.series(Metric::LastYield), record.yield_liters)?;
        set.set_gauge(&labels.series(Metric::LastYieldTimestamp), end_secs)?;
        set.add_gauge(&labels.series(Metric::YieldTotal), record.yield_liters)?;

        if let Some(conductivity) = record.conductivity {
            set.set_gauge(
                &labels.series(Metric::Conductivity),
                f64::from(conductivity),
            )?;
        }

        if let Some(duration) = record.duration_secs {
            let duration = f64::from(duration);
            set.observe(&labels.series(Metric::MilkingDuration), duration)?;
            set.set_gauge(&labels.series(Metric::LastDuration), duration)?;
            set.set_gauge(&labels.series(Metric::LastDurationTimestamp), end_secs)?;
        }

        if let Some(scc) = record.somatic_cell_count {
            let scc = f64::from(scc);
            set.add_gauge(&labels.series(Metric::SomaticCellTotal), scc)?;
            set.set_gauge(&labels.series(Metric::LastSomaticCell), scc)?;
            set.set_gauge(&labels.series(Metric::LastSomaticCellTimestamp), end_secs)?;
        }

        if let Some(days) = record.days_in_lactation {
            set.set_gauge(&labels.series(Metric::DaysInLactation), f64::from(days))?;
        }

        if let Some(teats) = record.incomplete {
            self.apply_teats(&labels, teats, Metric::IncompleteTeat, Metric::IncompleteTeats)?;
        }
        if let Some(teats) = record.kickoff {
            self.apply_teats(&labels, teats, Metric::KickoffTeat, Metric::KickoffTeats)?;
        }

        Ok(())
    }

    /// Per-teat gauges plus one combination gauge for a non-empty set.
    fn apply_teats(
        &self,
        labels: &LabelKey,
        teats: TeatSet,
        per_teat: Metric,
        combined: Metric,
    ) -> Result<()> {
        for teat in teats.iter() {
            self.set
                .inc_gauge(&labels.series_with(per_teat, "teat", teat.as_str()))?;
        }
        if !teats.is_empty() {
            self.set
                .inc_gauge(&labels.series_with(combined, "teats", &teats.label()))?;
        }
        Ok(())
    }

    /// Applies records in the order given, without producing output.
    ///
    /// Records must already be sorted by OID; the engine does not sort.
    ///
    /// # Errors
    ///
    /// Propagates the first update error.
    pub fn apply_all(&self, records: &[MilkingRecord]) -> Result<()> {
        for record in records {
            self.apply(record)?;
            debug!(oid = record.oid, animal = %record.animal_number, "applied milking record");
        }
        Ok(())
    }

    /// Applies records in order and, after each one, writes every series of
    /// the set timestamped with that record's end time.
    ///
    /// # Errors
    ///
    /// Returns an error if an update fails or the writer fails.
    pub fn write_records<W: Write + ?Sized>(
        &self,
        records: &[MilkingRecord],
        out: &mut W,
    ) -> Result<()> {
        for record in records {
            self.write_record(record, out)?;
        }
        Ok(())
    }

    /// Applies one record and writes the set's samples at its end time.
    ///
    /// # Errors
    ///
    /// Returns an error if an update, the encoder or the writer fails.
    pub fn write_record<W: Write + ?Sized>(
        &self,
        record: &MilkingRecord,
        out: &mut W,
    ) -> Result<()> {
        self.apply(record)?;
        write_timestamped(&self.set, out, record.end_timestamp_millis())
    }

    /// Materialises the accumulating series of a record's label key at zero
    /// without counting anything.
    ///
    /// Returns true if at least one series was created.
    pub fn initialize_series(&self, record: &MilkingRecord) -> bool {
        let labels = record.label_key();
        let mut created = false;
        for metric in ACCUMULATING {
            created |= self.set.ensure(&labels.series(metric));
        }
        created
    }

    /// Sets the device utilisation gauges from sessions-per-device counts.
    ///
    /// # Errors
    ///
    /// Returns an error only if the catalog entry is not a gauge.
    pub fn apply_device_utilization(&self, utilization: &BTreeMap<String, u64>) -> Result<()> {
        for (device_id, sessions) in utilization {
            let key = device_series(device_id);
            self.set.set_gauge(&key, *sessions as f64)?;
        }
        Ok(())
    }
}

/// The utilisation series of one milking device.
#[must_use]
pub fn device_series(device_id: &str) -> SeriesKey {
    SeriesKey::new(
        Metric::DeviceUtilization,
        vec![("milk_device_id".to_string(), device_id.to_string())],
    )
}

/// Series that accumulate over an animal's history and need a zero baseline.
pub const ACCUMULATING: [Metric; 4] = [
    Metric::MilkSessions,
    Metric::YieldTotal,
    Metric::SomaticCellTotal,
    Metric::MilkingDuration,
];
