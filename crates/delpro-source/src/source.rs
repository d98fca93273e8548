//! The record source abstraction.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use delpro_metrics::MilkingRecord;

use crate::error::Result;
use crate::query::RecordQuery;

/// Sessions per milking device.
pub type DeviceUtilization = BTreeMap<String, u64>;

/// A provider of milking-session records.
///
/// Records returned by [`query`](Self::query) are ordered by ascending OID,
/// have sanitized label fields and localised breed names. Rows that cannot be
/// decoded are skipped by the implementation, not reported as errors.
pub trait RecordSource: Send + Sync {
    /// Returns the records matching `query`, ordered by OID.
    ///
    /// # Errors
    ///
    /// Returns error if the backing store cannot be queried.
    fn query<'a>(
        &'a self,
        query: &'a RecordQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MilkingRecord>>> + Send + 'a>>;

    /// Returns the number of sessions per device over the last day.
    ///
    /// # Errors
    ///
    /// Returns error if the backing store cannot be queried.
    fn device_utilization<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceUtilization>> + Send + 'a>>;
}
