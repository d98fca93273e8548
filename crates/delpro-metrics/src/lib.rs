//! Metric generation and historical replay for DelPro milking sessions.
//!
//! `delpro-metrics` turns milking-session records into Prometheus exposition
//! output. Metric families live in a `prometheus-client` registry; the crate
//! performs no I/O of its own beyond writing to a caller-supplied
//! [`std::io::Write`].
//!
//! # Features
//!
//! - **Live set**: a shared [`MetricSet`] mutated in place and encoded on scrape
//! - **Historical replay**: per-animal isolated sets, timestamped output and
//!   zero-point bracketing around every replayed series
//! - **Nullable fields**: metrics derived from absent columns are skipped
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use delpro_metrics::{HistoricalReplay, MilkingRecord};
//!
//! let end = Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap();
//! let records = vec![MilkingRecord::new(1, "42", end, 11.5).with_duration(420)];
//!
//! let mut out = Vec::new();
//! let summary = HistoricalReplay::new().write(&records, &mut out).unwrap();
//! assert_eq!(summary.highest_oid, Some(1));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod engine;
pub mod error;
pub mod exposition;
pub mod model;
pub mod registry;
pub mod replay;

// Re-export main types at crate root
pub use engine::{device_series, MetricEngine};
pub use error::{MetricsError, Result};
pub use exposition::{sample_lines, write_timestamped, CONTENT_TYPE};
pub use model::{
    decode_teats, sanitize_label_value, LabelKey, LabelSet, Metric, MetricKind, MilkingRecord,
    Teat, TeatSet,
};
pub use registry::{FloatGauge, MetricSet, SeriesKey};
pub use replay::{highest_oid, BracketPolicy, HistoricalReplay, ReplaySummary};
