//! Milking-session record sources for the DelPro exporter.
//!
//! A [`RecordSource`] answers two questions: which sessions completed inside
//! a time and OID window, and how many sessions each milking device handled
//! over the last day. Records leave a source ordered by OID, with label fields
//! sanitized and breed names localised.
//!
//! Implementations:
//! - [`SqlServerSource`]: the DelPro SQL Server database
//! - [`MemorySource`]: records held in memory, for tests and embedding

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod localize;
pub mod memory;
pub mod query;
pub mod source;
pub mod sqlserver;

pub use error::{Result, SourceError};
pub use localize::localize_breed;
pub use memory::MemorySource;
pub use query::RecordQuery;
pub use source::{DeviceUtilization, RecordSource};
pub use sqlserver::{DbSettings, SqlServerSource};
