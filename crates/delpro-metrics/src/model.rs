//! Milking-session records and the fixed metric catalog derived from them.
//!
//! This module provides:
//! - [`MilkingRecord`]: one completed milking session for one animal
//! - [`Teat`] and [`TeatSet`]: decoding of the 4-bit incomplete/kickoff fields
//! - [`LabelKey`]: the stable label set a record's series are keyed by
//! - [`Metric`]: the catalog of exported metric names

use std::fmt;

use chrono::{DateTime, Utc};

use crate::registry::SeriesKey;

/// Ordered `(name, value)` label pairs of one series.
pub type LabelSet = Vec<(String, String)>;

/// Label value rendered when a record carries no lactation number.
pub const UNKNOWN_LACTATION: &str = "unknown";

/// Label value rendered for an empty teat set.
pub const NO_TEATS: &str = "none";

/// One of the four milking positions of an animal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Teat {
    /// Bit 1.
    LeftFront,
    /// Bit 2.
    RightFront,
    /// Bit 4.
    LeftRear,
    /// Bit 8.
    RightRear,
}

impl Teat {
    /// All teats in label order: front-left, front-right, rear-left, rear-right.
    pub const ALL: [Self; 4] = [
        Self::LeftFront,
        Self::RightFront,
        Self::LeftRear,
        Self::RightRear,
    ];

    /// Returns the bit this teat occupies in a teat bitfield.
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::LeftFront => 1,
            Self::RightFront => 2,
            Self::LeftRear => 4,
            Self::RightRear => 8,
        }
    }

    /// Returns the label value for this teat.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LeftFront => "left_front",
            Self::RightFront => "right_front",
            Self::LeftRear => "left_rear",
            Self::RightRear => "right_rear",
        }
    }
}

impl fmt::Display for Teat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of teats decoded from a 4-bit field.
///
/// Bits above the low nibble are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TeatSet(u8);

impl TeatSet {
    /// Creates a teat set from a raw bitfield.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    /// Returns the raw bitfield.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if no teat is flagged.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the given teat is flagged.
    #[must_use]
    pub const fn contains(self, teat: Teat) -> bool {
        self.0 & teat.bit() != 0
    }

    /// Iterates over the flagged teats in label order.
    pub fn iter(self) -> impl Iterator<Item = Teat> {
        Teat::ALL.into_iter().filter(move |teat| self.contains(*teat))
    }

    /// Renders the comma-joined teat list, or `"none"` when empty.
    #[must_use]
    pub fn label(self) -> String {
        if self.is_empty() {
            return NO_TEATS.to_string();
        }
        self.iter().map(Teat::as_str).collect::<Vec<_>>().join(",")
    }
}

/// Decodes a teat bitfield into the flagged teats, in label order.
#[must_use]
pub fn decode_teats(bitfield: u8) -> Vec<Teat> {
    TeatSet::from_bits(bitfield).iter().collect()
}

/// Removes characters that would break a label value in the exposition format.
#[must_use]
pub fn sanitize_label_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '"' | '\\' | '\n' | '\r'))
        .collect()
}

/// One completed milking session for one animal on one device.
///
/// Optional fields are `None` when the upstream column is null; every metric
/// derived from such a field is skipped for that record.
#[derive(Debug, Clone, PartialEq)]
pub struct MilkingRecord {
    /// Increasing row identifier, used as the processing cursor.
    pub oid: i64,
    /// Farm animal number.
    pub animal_number: String,
    /// Animal name.
    pub animal_name: String,
    /// Official registration number.
    pub animal_reg_no: String,
    /// Localised breed display name.
    pub breed: String,
    /// Milking device identifier.
    pub device_id: String,
    /// Milk destination (tank, drain, ...).
    pub destination: String,
    /// Current lactation number.
    pub lactation_number: Option<i32>,
    /// Days since the current lactation started.
    pub days_in_lactation: Option<i32>,
    /// Milk yield in liters.
    pub yield_liters: f64,
    /// Average conductivity in mS/cm.
    pub conductivity: Option<i32>,
    /// Session duration in seconds.
    pub duration_secs: Option<i32>,
    /// Somatic cell count in cells/ml.
    pub somatic_cell_count: Option<i32>,
    /// Teats flagged as incompletely milked.
    pub incomplete: Option<TeatSet>,
    /// Teats flagged with a kickoff event.
    pub kickoff: Option<TeatSet>,
    /// Session start.
    pub begin_time: DateTime<Utc>,
    /// Session end; the timestamp every metric of this record is emitted at.
    pub end_time: DateTime<Utc>,
}

impl MilkingRecord {
    /// Creates a record with the required fields set and every optional field absent.
    #[must_use]
    pub fn new(
        oid: i64,
        animal_number: impl Into<String>,
        end_time: DateTime<Utc>,
        yield_liters: f64,
    ) -> Self {
        Self {
            oid,
            animal_number: animal_number.into(),
            animal_name: String::new(),
            animal_reg_no: String::new(),
            breed: String::new(),
            device_id: String::new(),
            destination: String::new(),
            lactation_number: None,
            days_in_lactation: None,
            yield_liters,
            conductivity: None,
            duration_secs: None,
            somatic_cell_count: None,
            incomplete: None,
            kickoff: None,
            begin_time: end_time,
            end_time,
        }
    }

    /// Sets the animal name and registration number.
    #[must_use]
    pub fn with_animal(mut self, name: impl Into<String>, reg_no: impl Into<String>) -> Self {
        self.animal_name = name.into();
        self.animal_reg_no = reg_no.into();
        self
    }

    /// Sets the breed display name.
    #[must_use]
    pub fn with_breed(mut self, breed: impl Into<String>) -> Self {
        self.breed = breed.into();
        self
    }

    /// Sets the milking device.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Sets the milk destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Sets the lactation number and days in lactation.
    #[must_use]
    pub const fn with_lactation(mut self, number: i32, days: i32) -> Self {
        self.lactation_number = Some(number);
        self.days_in_lactation = Some(days);
        self
    }

    /// Sets the conductivity.
    #[must_use]
    pub const fn with_conductivity(mut self, conductivity: i32) -> Self {
        self.conductivity = Some(conductivity);
        self
    }

    /// Sets the session duration in seconds.
    #[must_use]
    pub const fn with_duration(mut self, seconds: i32) -> Self {
        self.duration_secs = Some(seconds);
        self
    }

    /// Sets the somatic cell count.
    #[must_use]
    pub const fn with_somatic_cell_count(mut self, count: i32) -> Self {
        self.somatic_cell_count = Some(count);
        self
    }

    /// Sets the incomplete-teat bitfield.
    #[must_use]
    pub const fn with_incomplete(mut self, bits: u8) -> Self {
        self.incomplete = Some(TeatSet::from_bits(bits));
        self
    }

    /// Sets the kickoff-teat bitfield.
    #[must_use]
    pub const fn with_kickoff(mut self, bits: u8) -> Self {
        self.kickoff = Some(TeatSet::from_bits(bits));
        self
    }

    /// Sets the session start.
    #[must_use]
    pub const fn with_begin_time(mut self, begin_time: DateTime<Utc>) -> Self {
        self.begin_time = begin_time;
        self
    }

    /// Strips exposition-hostile characters from every label-bearing field.
    pub fn sanitize(&mut self) {
        for value in [
            &mut self.animal_number,
            &mut self.animal_name,
            &mut self.animal_reg_no,
            &mut self.breed,
            &mut self.device_id,
            &mut self.destination,
        ] {
            if value.contains(['"', '\\', '\n', '\r']) {
                *value = sanitize_label_value(value);
            }
        }
    }

    /// Returns the label key of this record.
    #[must_use]
    pub fn label_key(&self) -> LabelKey {
        LabelKey::from_record(self)
    }

    /// Session end as milliseconds since the Unix epoch.
    #[must_use]
    pub fn end_timestamp_millis(&self) -> i64 {
        self.end_time.timestamp_millis()
    }
}

/// The ordered label set identifying an animal's series.
///
/// Derived from animal identity, device, destination and lactation; never
/// from the OID or time. Values are expected to be sanitized already.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelKey(LabelSet);

impl LabelKey {
    /// Builds the label key for a record.
    #[must_use]
    pub fn from_record(record: &MilkingRecord) -> Self {
        let lactation = record
            .lactation_number
            .map_or_else(|| UNKNOWN_LACTATION.to_string(), |n| n.to_string());
        let pairs = [
            ("animal_number", record.animal_number.clone()),
            ("animal_name", record.animal_name.clone()),
            ("animal_reg_no", record.animal_reg_no.clone()),
            ("breed", record.breed.clone()),
            ("milk_device_id", record.device_id.clone()),
            ("destination", record.destination.clone()),
            ("lactation", lactation),
        ];
        Self(
            pairs
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }

    /// Returns the label pairs in exposition order.
    #[must_use]
    pub fn labels(&self) -> &[(String, String)] {
        &self.0
    }

    /// Returns the series of `metric` carrying exactly this label set.
    #[must_use]
    pub fn series(&self, metric: Metric) -> SeriesKey {
        SeriesKey::new(metric, self.0.clone())
    }

    /// Returns the series of `metric` carrying this label set plus one more label.
    #[must_use]
    pub fn series_with(&self, metric: Metric, name: &str, value: &str) -> SeriesKey {
        let mut labels = self.0.clone();
        labels.push((name.to_string(), value.to_string()));
        SeriesKey::new(metric, labels)
    }
}

impl fmt::Display for LabelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}=\"{value}\"")?;
        }
        Ok(())
    }
}

/// How a catalog metric is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic integer count.
    Counter,
    /// Arbitrary floating-point value.
    Gauge,
    /// Bucketed distribution with sum and count.
    Histogram,
}

impl MetricKind {
    /// Returns the exposition `# TYPE` keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bounds for the milking-duration histogram, in seconds.
pub const DURATION_BUCKETS: [f64; 12] = [
    120.0, 180.0, 240.0, 300.0, 360.0, 420.0, 480.0, 600.0, 720.0, 900.0, 1200.0, 1800.0,
];

/// The fixed catalog of exported metrics.
///
/// Names are part of the contract with downstream dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    /// Completed milking sessions.
    MilkSessions,
    /// Yield of the last session.
    LastYield,
    /// End time of the last session with a yield.
    LastYieldTimestamp,
    /// Cumulative yield.
    YieldTotal,
    /// Conductivity of the last session.
    Conductivity,
    /// Distribution of session durations.
    MilkingDuration,
    /// Duration of the last session.
    LastDuration,
    /// End time of the last session with a duration.
    LastDurationTimestamp,
    /// Cumulative somatic cell count.
    SomaticCellTotal,
    /// Somatic cell count of the last session.
    LastSomaticCell,
    /// End time of the last session with a somatic cell count.
    LastSomaticCellTimestamp,
    /// Days in the current lactation.
    DaysInLactation,
    /// Incomplete-milking events per teat.
    IncompleteTeat,
    /// Kickoff events per teat.
    KickoffTeat,
    /// Incomplete-milking events per teat combination.
    IncompleteTeats,
    /// Kickoff events per teat combination.
    KickoffTeats,
    /// Sessions per device over the last day.
    DeviceUtilization,
}

impl Metric {
    /// Every catalog entry, in exposition order.
    pub const ALL: [Self; 17] = [
        Self::MilkSessions,
        Self::LastYield,
        Self::LastYieldTimestamp,
        Self::YieldTotal,
        Self::Conductivity,
        Self::MilkingDuration,
        Self::LastDuration,
        Self::LastDurationTimestamp,
        Self::SomaticCellTotal,
        Self::LastSomaticCell,
        Self::LastSomaticCellTimestamp,
        Self::DaysInLactation,
        Self::IncompleteTeat,
        Self::KickoffTeat,
        Self::IncompleteTeats,
        Self::KickoffTeats,
        Self::DeviceUtilization,
    ];

    /// Returns the exported metric name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MilkSessions => "delpro_milk_sessions_total",
            Self::LastYield => "delpro_milk_last_yield_liters",
            Self::LastYieldTimestamp => "delpro_milk_last_yield_timestamp",
            Self::YieldTotal => "delpro_milk_yield_liters_total",
            Self::Conductivity => "delpro_milk_conductivity_mScm",
            Self::MilkingDuration => "delpro_milking_duration_seconds",
            Self::LastDuration => "delpro_last_milking_duration_seconds",
            Self::LastDurationTimestamp => "delpro_last_milking_duration_timestamp",
            Self::SomaticCellTotal => "delpro_milk_somatic_cell_total",
            Self::LastSomaticCell => "delpro_milk_last_somatic_cell",
            Self::LastSomaticCellTimestamp => "delpro_milk_last_somatic_cell_timestamp",
            Self::DaysInLactation => "delpro_animal_days_in_lactation",
            Self::IncompleteTeat => "delpro_milking_incomplete_teat",
            Self::KickoffTeat => "delpro_milking_kickoff_teat",
            Self::IncompleteTeats => "delpro_milking_incomplete_teats",
            Self::KickoffTeats => "delpro_milking_kickoff_teats",
            Self::DeviceUtilization => "delpro_device_utilization_sessions_per_hour",
        }
    }

    /// Returns the name the metric family is registered under.
    ///
    /// Counter samples get their `_total` suffix from the encoder, so it is
    /// stripped here.
    #[must_use]
    pub fn registered_name(self) -> &'static str {
        let name = self.name();
        match self.kind() {
            MetricKind::Counter => name.strip_suffix("_total").unwrap_or(name),
            _ => name,
        }
    }

    /// Returns the position of this entry in [`Metric::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the `# HELP` text.
    #[must_use]
    pub const fn help(self) -> &'static str {
        match self {
            Self::MilkSessions => "Total number of completed milking sessions",
            Self::LastYield => "Milk yield of the last session in liters",
            Self::LastYieldTimestamp => "Unix time of the last session yield",
            Self::YieldTotal => "Cumulative milk yield in liters",
            Self::Conductivity => "Average milk conductivity of the last session in mS/cm",
            Self::MilkingDuration => "Milking session duration in seconds",
            Self::LastDuration => "Duration of the last milking session in seconds",
            Self::LastDurationTimestamp => "Unix time of the last milking duration",
            Self::SomaticCellTotal => "Cumulative somatic cell count",
            Self::LastSomaticCell => "Somatic cell count of the last session",
            Self::LastSomaticCellTimestamp => "Unix time of the last somatic cell count",
            Self::DaysInLactation => "Days since the start of the current lactation",
            Self::IncompleteTeat => "Incomplete milking events per teat",
            Self::KickoffTeat => "Kickoff events per teat",
            Self::IncompleteTeats => "Incomplete milking events per teat combination",
            Self::KickoffTeats => "Kickoff events per teat combination",
            Self::DeviceUtilization => "Milking sessions per device over the last day",
        }
    }

    /// Returns how this metric is exposed.
    #[must_use]
    pub const fn kind(self) -> MetricKind {
        match self {
            Self::MilkSessions => MetricKind::Counter,
            Self::MilkingDuration => MetricKind::Histogram,
            _ => MetricKind::Gauge,
        }
    }

    /// Returns the histogram bucket bounds, empty for non-histograms.
    #[must_use]
    pub const fn buckets(self) -> &'static [f64] {
        match self {
            Self::MilkingDuration => &DURATION_BUCKETS,
            _ => &[],
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
