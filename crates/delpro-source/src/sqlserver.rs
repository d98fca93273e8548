//! DelPro SQL Server record source.
//!
//! Reads completed milking sessions from the DelPro database with `tiberius`.
//! Every query opens its own connection; the exporter issues at most one live
//! query per update interval plus on-demand historical queries, so pooling
//! buys nothing.
//!
//! DelPro stores naive local times. They are interpreted in the configured
//! database timezone on the way in and out.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Query, Row};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

use delpro_metrics::MilkingRecord;

use crate::error::{Result, SourceError};
use crate::localize::localize_breed;
use crate::query::RecordQuery;
use crate::source::{DeviceUtilization, RecordSource};

/// Timeout for opening the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for one startup ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Startup ping attempts before giving up.
pub const PING_ATTEMPTS: u32 = 3;

/// Backoff unit between ping attempts; attempt `n` waits `n` units.
pub const PING_BACKOFF: Duration = Duration::from_secs(2);

const RECORDS_SQL: &str = "
    SELECT
        CAST(smy.OID AS BIGINT) AS oid,
        CAST(ba.Number AS VARCHAR(10)) AS animal_number,
        COALESCE(ba.Name, 'Unknown') AS animal_name,
        COALESCE(ba.OfficialRegNo, 'Unknown') AS animal_reg_no,
        COALESCE(tli.ItemValue, CAST(ba.Breed AS VARCHAR(10))) AS breed_name,
        CAST(smy.MilkingDevice AS VARCHAR(10)) AS device_id,
        COALESCE(md.Name, 'Unknown') AS destination_name,
        CAST(als.LactationNumber AS INT) AS lactation_number,
        DATEDIFF(day, als.StartDate, smy.EndTime) AS days_in_lactation,
        CAST(smy.TotalYield AS FLOAT) AS total_yield,
        CAST(smy.AvgConductivity AS INT) AS conductivity,
        DATEDIFF(second, smy.BeginTime, smy.EndTime) AS duration_seconds,
        CAST(vmy.Occ AS INT) AS somatic_cell_count,
        CAST(vmy.Incomplete AS INT) AS incomplete,
        CAST(vmy.Kickoff AS INT) AS kickoff,
        smy.BeginTime AS begin_time,
        smy.EndTime AS end_time
    FROM SessionMilkYield smy
    INNER JOIN BasicAnimal ba ON smy.BasicAnimal = ba.OID
    LEFT JOIN TextLookupItem tli ON ba.Breed = tli.ItemID AND tli.Collection = 6
    LEFT JOIN VoluntarySessionMilkYield vmy ON smy.OID = vmy.OID
    LEFT JOIN MilkDestination md ON smy.Destination = md.OID
    LEFT JOIN AnimalLactationSummary als ON ba.OID = als.Animal AND als.EndDate IS NULL
    WHERE smy.EndTime >= @P1 AND smy.EndTime < @P2
    AND smy.OID > @P3
    AND smy.TotalYield IS NOT NULL
    AND ba.Number IS NOT NULL";

const DEVICE_UTILIZATION_SQL: &str = "
    SELECT
        CAST(MilkingDevice AS VARCHAR(10)) AS device_id,
        CAST(COUNT(*) AS BIGINT) AS session_count
    FROM SessionMilkYield
    WHERE BeginTime >= DATEADD(day, -1, GETDATE())
    AND TotalYield IS NOT NULL
    GROUP BY MilkingDevice";

/// Builds the record query text, with an upper OID bound when `bounded`.
fn records_sql(bounded: bool) -> String {
    let mut sql = String::from(RECORDS_SQL);
    if bounded {
        sql.push_str("\n    AND smy.OID <= @P4");
    }
    sql.push_str("\n    ORDER BY smy.OID");
    sql
}

/// Connection settings for the DelPro database.
#[derive(Clone)]
pub struct DbSettings {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database name.
    pub database: String,
    /// SQL login.
    pub user: String,
    password: String,
}

impl DbSettings {
    /// Creates connection settings.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::InvalidConfig` if a required field is empty.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(SourceError::InvalidConfig("database host is empty".into()));
        }
        if self.database.is_empty() {
            return Err(SourceError::InvalidConfig("database name is empty".into()));
        }
        if self.password.is_empty() {
            return Err(SourceError::InvalidConfig("database password is empty".into()));
        }
        Ok(())
    }

    fn client_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.authentication(AuthMethod::sql_server(&self.user, &self.password));
        config.encryption(EncryptionLevel::NotSupported);
        config.trust_cert();
        config
    }
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Converts fetched rows into records.
///
/// A row that fails to read or validate is logged and skipped; the rest of
/// the batch is kept in row order.
fn decode_rows(
    rows: impl IntoIterator<Item = Result<RawSession>>,
    timezone: Tz,
) -> Vec<MilkingRecord> {
    rows.into_iter()
        .filter_map(|row| match row.and_then(|raw| raw.into_record(timezone)) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "skipping milking row");
                None
            }
        })
        .collect()
}

/// Columns of one session row before validation.
#[derive(Debug, Clone, PartialEq, Default)]
struct RawSession {
    oid: Option<i64>,
    animal_number: Option<String>,
    animal_name: Option<String>,
    animal_reg_no: Option<String>,
    breed: Option<String>,
    device_id: Option<String>,
    destination: Option<String>,
    lactation_number: Option<i32>,
    days_in_lactation: Option<i32>,
    total_yield: Option<f64>,
    conductivity: Option<i32>,
    duration_seconds: Option<i32>,
    somatic_cell_count: Option<i32>,
    incomplete: Option<i32>,
    kickoff: Option<i32>,
    begin_time: Option<NaiveDateTime>,
    end_time: Option<NaiveDateTime>,
}

impl RawSession {
    fn from_row(row: &Row) -> Result<Self> {
        let text = |column: &str| -> Result<Option<String>> {
            Ok(row.try_get::<&str, _>(column)?.map(str::to_string))
        };
        Ok(Self {
            oid: row.try_get("oid")?,
            animal_number: text("animal_number")?,
            animal_name: text("animal_name")?,
            animal_reg_no: text("animal_reg_no")?,
            breed: text("breed_name")?,
            device_id: text("device_id")?,
            destination: text("destination_name")?,
            lactation_number: row.try_get("lactation_number")?,
            days_in_lactation: row.try_get("days_in_lactation")?,
            total_yield: row.try_get("total_yield")?,
            conductivity: row.try_get("conductivity")?,
            duration_seconds: row.try_get("duration_seconds")?,
            somatic_cell_count: row.try_get("somatic_cell_count")?,
            incomplete: row.try_get("incomplete")?,
            kickoff: row.try_get("kickoff")?,
            begin_time: row.try_get("begin_time")?,
            end_time: row.try_get("end_time")?,
        })
    }

    /// Validates the row and converts it into a cleaned record.
    fn into_record(self, timezone: Tz) -> Result<MilkingRecord> {
        let oid = self
            .oid
            .ok_or_else(|| SourceError::Decode("missing OID".into()))?;
        let missing = |column: &str| SourceError::Decode(format!("OID {oid}: missing {column}"));

        let animal_number = self.animal_number.ok_or_else(|| missing("animal number"))?;
        let yield_liters = self.total_yield.ok_or_else(|| missing("total yield"))?;
        let end_naive = self.end_time.ok_or_else(|| missing("end time"))?;
        let end_time = from_db_time(timezone, end_naive).ok_or_else(|| {
            SourceError::Decode(format!("OID {oid}: end time {end_naive} does not exist in {timezone}"))
        })?;
        let begin_time = self
            .begin_time
            .and_then(|naive| from_db_time(timezone, naive))
            .unwrap_or(end_time);

        let mut record = MilkingRecord::new(oid, animal_number, end_time, yield_liters)
            .with_animal(
                self.animal_name.unwrap_or_default(),
                self.animal_reg_no.unwrap_or_default(),
            )
            .with_breed(self.breed.unwrap_or_default())
            .with_device(self.device_id.unwrap_or_default())
            .with_destination(self.destination.unwrap_or_default())
            .with_begin_time(begin_time);
        record.lactation_number = self.lactation_number;
        record.days_in_lactation = self.days_in_lactation;
        record.conductivity = self.conductivity;
        record.duration_secs = self.duration_seconds;
        record.somatic_cell_count = self.somatic_cell_count;
        if let Some(bits) = self.incomplete {
            record = record.with_incomplete((bits & 0x0f) as u8);
        }
        if let Some(bits) = self.kickoff {
            record = record.with_kickoff((bits & 0x0f) as u8);
        }

        record.sanitize();
        let breed = localize_breed(&record.breed);
        if breed != record.breed {
            record.breed = breed.to_string();
        }
        Ok(record)
    }
}

/// Converts a UTC instant to the database's naive local time.
fn to_db_time(timezone: Tz, time: DateTime<Utc>) -> NaiveDateTime {
    time.with_timezone(&timezone).naive_local()
}

/// Interprets a naive database time in `timezone`.
///
/// Ambiguous times resolve to the earlier instant; times skipped by a DST
/// change yield `None`.
fn from_db_time(timezone: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|time| time.with_timezone(&Utc))
}

/// [`RecordSource`] backed by the DelPro SQL Server database.
#[derive(Debug, Clone)]
pub struct SqlServerSource {
    settings: DbSettings,
    timezone: Tz,
}

impl SqlServerSource {
    /// Creates a source without contacting the server.
    #[must_use]
    pub const fn new(settings: DbSettings, timezone: Tz) -> Self {
        Self { settings, timezone }
    }

    /// Creates a source after checking that the server is reachable and
    /// accepts the credentials.
    ///
    /// The TCP check runs once; the login ping is attempted up to
    /// [`PING_ATTEMPTS`] times with linear backoff.
    ///
    /// # Errors
    ///
    /// Returns the last connection error if every attempt fails.
    pub async fn connect(settings: DbSettings, timezone: Tz) -> Result<Self> {
        settings.validate()?;
        let source = Self::new(settings, timezone);
        source.check_reachable().await?;
        source.ping_with_retries().await?;
        Ok(source)
    }

    /// Returns the database timezone.
    #[must_use]
    pub const fn timezone(&self) -> Tz {
        self.timezone
    }

    async fn check_reachable(&self) -> Result<()> {
        let address = self.settings.address();
        info!(%address, "testing network connectivity");
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => {
                info!(%address, "network connectivity test successful");
                Ok(())
            }
            Ok(Err(e)) => Err(SourceError::ConnectionFailed(format!("{address}: {e}"))),
            Err(_) => Err(SourceError::Timeout {
                seconds: CONNECT_TIMEOUT.as_secs(),
            }),
        }
    }

    async fn ping_with_retries(&self) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=PING_ATTEMPTS {
            info!(attempt, max_attempts = PING_ATTEMPTS, "database ping");
            let error = match timeout(PING_TIMEOUT, self.ping()).await {
                Ok(Ok(())) => {
                    info!("database connection successful");
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => SourceError::Timeout {
                    seconds: PING_TIMEOUT.as_secs(),
                },
            };
            warn!(attempt, max_attempts = PING_ATTEMPTS, error = %error, "database ping failed");
            last_error = Some(error);

            if attempt < PING_ATTEMPTS {
                tokio::time::sleep(PING_BACKOFF * attempt).await;
            }
        }
        Err(last_error.unwrap_or_else(|| SourceError::ConnectionFailed("no ping attempted".into())))
    }

    async fn ping(&self) -> Result<()> {
        let mut client = self.client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    async fn client(&self) -> Result<Client<Compat<TcpStream>>> {
        let config = self.settings.client_config();
        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(config.get_addr()))
            .await
            .map_err(|_| SourceError::Timeout {
                seconds: CONNECT_TIMEOUT.as_secs(),
            })??;
        tcp.set_nodelay(true)?;
        Ok(Client::connect(config, tcp.compat_write()).await?)
    }

    async fn fetch_records(&self, query: &RecordQuery) -> Result<Vec<MilkingRecord>> {
        let mut client = self.client().await?;

        let mut select = Query::new(records_sql(query.until_oid.is_some()));
        select.bind(to_db_time(self.timezone, query.start));
        select.bind(to_db_time(self.timezone, query.end));
        select.bind(query.after_oid);
        if let Some(until) = query.until_oid {
            select.bind(until);
        }

        let rows = select.query(&mut client).await?.into_first_result().await?;
        let total = rows.len();
        let records = decode_rows(rows.iter().map(RawSession::from_row), self.timezone);

        debug!(
            rows = total,
            records = records.len(),
            after_oid = query.after_oid,
            "fetched milking records"
        );
        Ok(records)
    }

    async fn fetch_device_utilization(&self) -> Result<DeviceUtilization> {
        let mut client = self.client().await?;
        let rows = client
            .simple_query(DEVICE_UTILIZATION_SQL)
            .await?
            .into_first_result()
            .await?;

        let mut utilization = DeviceUtilization::new();
        for row in &rows {
            let device: Option<&str> = row.try_get("device_id")?;
            let count: Option<i64> = row.try_get("session_count")?;
            match (device, count) {
                (Some(device), Some(count)) => {
                    utilization.insert(device.to_string(), u64::try_from(count).unwrap_or(0));
                }
                _ => warn!("skipping device utilization row with null columns"),
            }
        }
        Ok(utilization)
    }
}

impl RecordSource for SqlServerSource {
    fn query<'a>(
        &'a self,
        query: &'a RecordQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MilkingRecord>>> + Send + 'a>> {
        Box::pin(self.fetch_records(query))
    }

    fn device_utilization<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<DeviceUtilization>> + Send + 'a>> {
        Box::pin(self.fetch_device_utilization())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn raw() -> RawSession {
        RawSession {
            oid: Some(17),
            animal_number: Some("42".into()),
            animal_name: Some("Bella".into()),
            animal_reg_no: Some("CH1".into()),
            breed: Some("Holstein Friesian".into()),
            device_id: Some("2".into()),
            destination: Some("Tank".into()),
            total_yield: Some(11.5),
            begin_time: Some(naive(6)),
            end_time: Some(naive(7)),
            ..RawSession::default()
        }
    }

    mod sql_tests {
        use super::*;

        #[test]
        fn unbounded_query_has_no_upper_oid() {
            let sql = records_sql(false);
            assert!(sql.contains("smy.OID > @P3"));
            assert!(!sql.contains("@P4"));
            assert!(sql.trim_end().ends_with("ORDER BY smy.OID"));
        }

        #[test]
        fn bounded_query_filters_before_ordering() {
            let sql = records_sql(true);
            let bound = sql.find("smy.OID <= @P4").unwrap();
            let order = sql.find("ORDER BY").unwrap();
            assert!(bound < order);
        }
    }

    mod decode_tests {
        use super::*;

        #[test]
        fn complete_row_converts() {
            let record = RawSession {
                lactation_number: Some(3),
                days_in_lactation: Some(120),
                conductivity: Some(61),
                duration_seconds: Some(420),
                somatic_cell_count: Some(90_000),
                incomplete: Some(9),
                kickoff: Some(0),
                ..raw()
            }
            .into_record(Tz::UTC)
            .unwrap();

            assert_eq!(record.oid, 17);
            assert_eq!(record.breed, "Holstein");
            assert_eq!(record.lactation_number, Some(3));
            assert_eq!(record.duration_secs, Some(420));
            assert_eq!(record.incomplete.map(|t| t.bits()), Some(9));
            assert_eq!(record.kickoff.map(|t| t.bits()), Some(0));
        }

        #[test]
        fn null_optional_columns_stay_absent() {
            let record = raw().into_record(Tz::UTC).unwrap();
            assert_eq!(record.conductivity, None);
            assert_eq!(record.duration_secs, None);
            assert_eq!(record.incomplete, None);
            assert_eq!(record.kickoff, None);
            assert_eq!(record.lactation_number, None);
        }

        #[test]
        fn missing_required_column_is_a_decode_error() {
            let no_yield = RawSession {
                total_yield: None,
                ..raw()
            };
            assert!(matches!(
                no_yield.into_record(Tz::UTC),
                Err(SourceError::Decode(_))
            ));

            let no_oid = RawSession { oid: None, ..raw() };
            assert!(no_oid.into_record(Tz::UTC).is_err());
        }

        #[test]
        fn label_fields_are_sanitized() {
            let record = RawSession {
                animal_name: Some("\"Bella\"\n".into()),
                ..raw()
            }
            .into_record(Tz::UTC)
            .unwrap();
            assert_eq!(record.animal_name, "Bella");
        }

        #[test]
        fn bad_row_is_skipped_without_dropping_the_batch() {
            let rows = vec![
                Ok(RawSession { oid: Some(21), ..raw() }),
                Err(SourceError::Decode("column total_yield has type nvarchar".into())),
                Ok(RawSession {
                    oid: Some(22),
                    end_time: None,
                    ..raw()
                }),
                Ok(RawSession { oid: Some(23), ..raw() }),
            ];

            let oids: Vec<i64> = decode_rows(rows, Tz::UTC).iter().map(|r| r.oid).collect();
            assert_eq!(oids, [21, 23]);
        }

        #[test]
        fn empty_batch_decodes_to_nothing() {
            assert!(decode_rows(Vec::new(), Tz::UTC).is_empty());
        }

        #[test]
        fn high_teat_bits_are_masked() {
            let record = RawSession {
                incomplete: Some(0x1f),
                ..raw()
            }
            .into_record(Tz::UTC)
            .unwrap();
            assert_eq!(record.incomplete.map(|t| t.bits()), Some(0x0f));
        }
    }

    mod time_tests {
        use super::*;

        #[test]
        fn database_times_are_local() {
            // Zurich is UTC+1 in March before the DST switch.
            let zurich = Tz::Europe__Zurich;
            let utc = from_db_time(zurich, naive(7)).unwrap();
            assert_eq!(utc, Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap());
            assert_eq!(to_db_time(zurich, utc), naive(7));
        }

        #[test]
        fn skipped_local_time_is_rejected() {
            let gap = NaiveDate::from_ymd_opt(2025, 3, 30)
                .unwrap()
                .and_hms_opt(2, 30, 0)
                .unwrap();
            assert_eq!(from_db_time(Tz::Europe__Zurich, gap), None);
        }
    }

    #[test]
    fn settings_debug_redacts_password() {
        let settings = DbSettings::new("db", 1433, "DDM", "sa", "hunter2");
        let debug = format!("{settings:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn settings_validation() {
        assert!(DbSettings::new("db", 1433, "DDM", "sa", "pw").validate().is_ok());
        assert!(DbSettings::new("db", 1433, "DDM", "sa", "").validate().is_err());
        assert!(DbSettings::new("", 1433, "DDM", "sa", "pw").validate().is_err());
    }
}
