//! # delpro-exporter
//!
//! Prometheus exporter for DelPro milking sessions.
//!
//! A background [`LiveUpdater`] folds new sessions into a shared metric set,
//! served on `/metrics`. `/historical-metrics` replays any window of sessions
//! as timestamped exposition lines for backfilling a time-series store.
//!
//! ## Endpoints
//!
//! | Endpoint | Description |
//! |----------|-------------|
//! | `/` | Landing page |
//! | `/metrics` | Live series, no timestamps |
//! | `/historical-metrics` | Timestamped replay by time window or OID range |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod handlers;
pub mod historical;
pub mod live;
pub mod routes;
pub mod server;
pub mod state;

// Re-export main types
pub use config::{Cli, ExporterConfig, LogFormat};
pub use cursor::OidCursor;
pub use error::{ExporterError, ExporterResult};
pub use historical::{HistoricalExport, HistoricalParams};
pub use live::{CycleOutcome, LiveUpdater};
pub use server::ExporterServer;
pub use state::ExporterState;
