//! Record query window.

use chrono::{DateTime, Utc};

use delpro_metrics::MilkingRecord;

/// Selects milking records by end time and OID.
///
/// A record matches when `start <= end_time < end`, `oid > after_oid` and,
/// if `until_oid` is set, `oid <= until_oid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordQuery {
    /// Inclusive lower bound on the session end time.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound on the session end time.
    pub end: DateTime<Utc>,
    /// Exclusive lower bound on the OID.
    pub after_oid: i64,
    /// Inclusive upper bound on the OID, unbounded when `None`.
    pub until_oid: Option<i64>,
}

impl RecordQuery {
    /// Creates a query for a time window with no OID restriction.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            after_oid: 0,
            until_oid: None,
        }
    }

    /// Only match records with an OID greater than `oid`.
    #[must_use]
    pub const fn after_oid(mut self, oid: i64) -> Self {
        self.after_oid = oid;
        self
    }

    /// Only match records with an OID up to and including `oid`.
    ///
    /// Zero or a negative value means unbounded.
    #[must_use]
    pub const fn until_oid(mut self, oid: i64) -> Self {
        self.until_oid = if oid > 0 { Some(oid) } else { None };
        self
    }

    /// Returns true if the record falls inside this query.
    #[must_use]
    pub fn matches(&self, record: &MilkingRecord) -> bool {
        record.end_time >= self.start
            && record.end_time < self.end
            && record.oid > self.after_oid
            && self.until_oid.is_none_or(|until| record.oid <= until)
    }
}
