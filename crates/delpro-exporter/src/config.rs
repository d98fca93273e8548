//! Exporter configuration.
//!
//! [`Cli`] holds the command line and environment surface; it resolves into
//! an [`ExporterConfig`], which also carries the fixed operational timings.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use clap::{Parser, ValueEnum};

use delpro_metrics::BracketPolicy;
use delpro_source::DbSettings;

use crate::error::{ExporterError, ExporterResult};

/// Default OID checkpoint file name, relative to the working directory.
pub const DEFAULT_OID_FILE: &str = "delpro_last_oid.txt";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Command line of the exporter binary.
#[derive(Debug, Parser)]
#[command(name = "delpro-exporter")]
#[command(about = "Prometheus exporter for DelPro milking sessions")]
#[command(version)]
pub struct Cli {
    /// Address to listen on for the web interface and telemetry
    #[arg(long, env = "DELPRO_LISTEN_ADDRESS", default_value = "0.0.0.0:9090")]
    pub listen_address: SocketAddr,

    /// Database host
    #[arg(long, env = "DELPRO_DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Database port
    #[arg(long, env = "DELPRO_DB_PORT", default_value_t = 1433)]
    pub db_port: u16,

    /// Database name
    #[arg(long, env = "DELPRO_DB_NAME", default_value = "DDM")]
    pub db_name: String,

    /// Database user
    #[arg(long, env = "DELPRO_DB_USER", default_value = "sa")]
    pub db_user: String,

    /// Database password
    #[arg(long, env = "SQL_PASSWORD", hide_env_values = true, hide = true)]
    pub db_password: String,

    /// IANA timezone the database stores its local times in
    #[arg(long, env = "DELPRO_DB_TIMEZONE", default_value = "Europe/Zurich")]
    pub db_timezone: String,

    /// Override the last processed OID (applied only if larger than the stored value)
    #[arg(long, env = "DELPRO_LAST_OID", default_value_t = 0)]
    pub last_oid: i64,

    /// Path of the OID checkpoint file [default: ./delpro_last_oid.txt]
    #[arg(long, env = "DELPRO_OID_FILE")]
    pub oid_file: Option<PathBuf>,

    /// Interval between live updates (e.g. 30s, 2m)
    #[arg(long, env = "DELPRO_UPDATE_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub update_interval: Duration,

    /// Default lookback of /historical-metrics, in days
    #[arg(long, env = "DELPRO_HISTORICAL_LOOKBACK_DAYS", default_value_t = 30)]
    pub historical_lookback_days: u32,

    /// Log output format
    #[arg(long, env = "DELPRO_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Resolves the command line into a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `ExporterError::Config` for an unknown timezone, a missing
    /// working directory or an invalid value.
    pub fn into_config(self) -> ExporterResult<ExporterConfig> {
        let timezone: Tz = self.db_timezone.parse().map_err(|_| {
            ExporterError::Config(format!("invalid database timezone: {}", self.db_timezone))
        })?;

        let oid_file = match self.oid_file {
            Some(path) => path,
            None => std::env::current_dir()
                .map(|dir| dir.join(DEFAULT_OID_FILE))
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_OID_FILE)),
        };

        let db = DbSettings::new(
            self.db_host,
            self.db_port,
            self.db_name,
            self.db_user,
            self.db_password,
        );

        let config = ExporterConfig::new(db)
            .with_listen_addr(self.listen_address)
            .with_timezone(timezone)
            .with_oid_file(oid_file)
            .with_oid_floor(self.last_oid)
            .with_update_interval(self.update_interval)
            .with_historical_lookback(Duration::from_secs(
                u64::from(self.historical_lookback_days) * 24 * 60 * 60,
            ));
        config.validate()?;
        Ok(config)
    }
}

/// Parses `30s`, `5m`, `1h` or a bare number of seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };
    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 60 * 60,
        _ => return Err(format!("invalid duration unit in {value}, use s, m or h")),
    };
    Ok(Duration::from_secs(seconds))
}

/// Returns `end - lookback`, saturating at the earliest representable time.
pub(crate) fn window_start(end: DateTime<Utc>, lookback: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lookback)
        .ok()
        .and_then(|delta| end.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Configuration for the exporter.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,
    /// Database connection settings.
    pub db: DbSettings,
    /// Timezone the database stores local times in.
    pub timezone: Tz,
    /// OID checkpoint file.
    pub oid_file: PathBuf,
    /// Operator-supplied OID floor, applied only if larger than the checkpoint.
    pub oid_floor: i64,
    /// Interval between live updates.
    pub update_interval: Duration,
    /// Width of the live query window.
    pub live_lookback: Duration,
    /// How far the live window ends before now, so late columns are populated.
    pub settle_delay: Duration,
    /// Timeout of one live update query.
    pub live_query_timeout: Duration,
    /// Timeout of one historical request query.
    pub historical_query_timeout: Duration,
    /// Default lookback of a historical request without `start`.
    pub historical_lookback: Duration,
    /// Distance of replay brackets from the nearest record.
    pub bracket_offset: Duration,
    /// Replay bracket policy.
    pub bracket_policy: BracketPolicy,
}

impl ExporterConfig {
    /// Creates a configuration with default timings for the given database.
    #[must_use]
    pub fn new(db: DbSettings) -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            db,
            timezone: chrono_tz::Europe::Zurich,
            oid_file: PathBuf::from(DEFAULT_OID_FILE),
            oid_floor: 0,
            update_interval: Duration::from_secs(30),
            live_lookback: Duration::from_secs(24 * 60 * 60),
            settle_delay: Duration::from_secs(5 * 60),
            live_query_timeout: Duration::from_secs(30),
            historical_query_timeout: Duration::from_secs(60),
            historical_lookback: Duration::from_secs(30 * 24 * 60 * 60),
            bracket_offset: delpro_metrics::replay::DEFAULT_BRACKET_OFFSET,
            bracket_policy: BracketPolicy::Both,
        }
    }

    /// Set the listen address.
    #[must_use]
    pub const fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the database timezone.
    #[must_use]
    pub const fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Set the OID checkpoint file.
    #[must_use]
    pub fn with_oid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.oid_file = path.into();
        self
    }

    /// Set the OID floor.
    #[must_use]
    pub const fn with_oid_floor(mut self, oid: i64) -> Self {
        self.oid_floor = oid;
        self
    }

    /// Set the live update interval.
    #[must_use]
    pub const fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// Set the live settle delay.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the live and historical query timeouts.
    #[must_use]
    pub const fn with_query_timeouts(mut self, live: Duration, historical: Duration) -> Self {
        self.live_query_timeout = live;
        self.historical_query_timeout = historical;
        self
    }

    /// Set the default historical lookback.
    #[must_use]
    pub const fn with_historical_lookback(mut self, lookback: Duration) -> Self {
        self.historical_lookback = lookback;
        self
    }

    /// Set the replay bracket policy.
    #[must_use]
    pub const fn with_bracket_policy(mut self, policy: BracketPolicy) -> Self {
        self.bracket_policy = policy;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ExporterError::Config` describing the first invalid value.
    pub fn validate(&self) -> ExporterResult<()> {
        self.db
            .validate()
            .map_err(|e| ExporterError::Config(e.to_string()))?;
        if self.update_interval.is_zero() {
            return Err(ExporterError::Config("update interval must be positive".into()));
        }
        if self.live_lookback.is_zero() {
            return Err(ExporterError::Config("live lookback must be positive".into()));
        }
        if self.historical_lookback.is_zero() {
            return Err(ExporterError::Config(
                "historical lookback must be positive".into(),
            ));
        }
        if self.oid_floor < 0 {
            return Err(ExporterError::Config("last OID must not be negative".into()));
        }
        Ok(())
    }
}
