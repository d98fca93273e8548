//! In-memory record source.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use delpro_metrics::MilkingRecord;

use crate::error::{Result, SourceError};
use crate::localize::localize_breed;
use crate::query::RecordQuery;
use crate::source::{DeviceUtilization, RecordSource};

#[derive(Debug, Default)]
struct Inner {
    records: Vec<MilkingRecord>,
    utilization: DeviceUtilization,
    failure: Option<String>,
    queries: Vec<RecordQuery>,
}

/// A [`RecordSource`] over records held in memory.
///
/// Filtering, ordering and cleanup follow the database source. Clones share
/// state, so a test can keep a handle and append records while a consumer
/// holds another.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<RwLock<Inner>>,
}

impl MemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source holding `records`.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = MilkingRecord>) -> Self {
        let source = Self::new();
        source.extend(records);
        source
    }

    /// Appends records.
    pub fn extend(&self, records: impl IntoIterator<Item = MilkingRecord>) {
        self.inner.write().records.extend(records);
    }

    /// Appends one record.
    pub fn push(&self, record: MilkingRecord) {
        self.inner.write().records.push(record);
    }

    /// Sets the sessions-per-device counts returned by `device_utilization`.
    pub fn set_device_utilization(&self, utilization: DeviceUtilization) {
        self.inner.write().utilization = utilization;
    }

    /// Makes every following call fail with `reason` until cleared with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        self.inner.write().failure = reason.map(str::to_string);
    }

    /// Returns the queries received so far, oldest first.
    #[must_use]
    pub fn queries(&self) -> Vec<RecordQuery> {
        self.inner.read().queries.clone()
    }

    fn check_failure(&self) -> Result<()> {
        match &self.inner.read().failure {
            Some(reason) => Err(SourceError::QueryFailed(reason.clone())),
            None => Ok(()),
        }
    }

    fn select(&self, query: &RecordQuery) -> Vec<MilkingRecord> {
        let mut inner = self.inner.write();
        inner.queries.push(*query);

        let mut records: Vec<MilkingRecord> = inner
            .records
            .iter()
            .filter(|r| !r.animal_number.is_empty() && query.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.oid);

        for record in &mut records {
            record.sanitize();
            let breed = localize_breed(&record.breed);
            if breed != record.breed {
                record.breed = breed.to_string();
            }
        }
        records
    }
}

impl RecordSource for MemorySource {
    fn query<'a>(
        &'a self,
        query: &'a RecordQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MilkingRecord>>> + Send + 'a>> {
        Box::pin(async move {
            self.check_failure()?;
            Ok(self.select(query))
        })
    }

    fn device_utilization<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceUtilization>> + Send + 'a>> {
        Box::pin(async move {
            self.check_failure()?;
            Ok(self.inner.read().utilization.clone())
        })
    }
}
