//! Historical export: request parameters, replay and response encoding.
//!
//! A request resolves into a [`RecordQuery`]. The matching records are
//! replayed through isolated per-animal metric sets and streamed back as
//! timestamped exposition lines, gzip-compressed when the client accepts it.

use std::io::{BufWriter, IntoInnerError};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use tokio::io::DuplexStream;
use tokio::time::timeout;
use tokio_util::io::{ReaderStream, SyncIoBridge};
use tracing::{info, warn, Span};

use delpro_metrics::{highest_oid, HistoricalReplay, MilkingRecord, ReplaySummary, CONTENT_TYPE};
use delpro_source::RecordQuery;

use crate::config::window_start;
use crate::error::{ExporterError, ExporterResult};
use crate::state::ExporterState;

/// Response header carrying the highest OID in the export.
pub const HIGHEST_OID_HEADER: &str = "x-highest-oid";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Query parameters of `/historical-metrics`.
///
/// Empty values are treated as absent, except that a present `start_oid`
/// always selects OID mode.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct HistoricalParams {
    /// Window start, RFC 3339 or `YYYY-MM-DD`.
    pub start: Option<String>,
    /// Window end, RFC 3339 or `YYYY-MM-DD`.
    pub end: Option<String>,
    /// Exclusive lower OID bound.
    pub start_oid: Option<String>,
    /// Inclusive upper OID bound, 0 or absent for unbounded.
    pub end_oid: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Start,
    End,
}

impl Bound {
    const fn name(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
        }
    }

    /// Local wall-clock time a date-only value stands for.
    fn on_date(self, date: NaiveDate) -> Option<NaiveDateTime> {
        match self {
            Self::Start => date.and_hms_opt(0, 0, 0),
            Self::End => date.and_hms_nano_opt(23, 59, 59, 999_999_999),
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

fn parse_time(value: &str, bound: Bound, timezone: Tz) -> ExporterResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let invalid = || {
        ExporterError::BadRequest(format!(
            "invalid {} time format, use RFC3339 (2025-01-31T06:00:00Z) or date format (2025-01-31)",
            bound.name()
        ))
    };
    let date = NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| invalid())?;
    let local = bound.on_date(date).ok_or_else(invalid)?;
    let resolved = timezone.from_local_datetime(&local);
    let instant = match bound {
        Bound::Start => resolved.earliest(),
        Bound::End => resolved.latest(),
    };
    instant
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| {
            ExporterError::BadRequest(format!(
                "{} date {value} does not exist in timezone {timezone}",
                bound.name()
            ))
        })
}

fn parse_oid(value: Option<&String>, name: &str) -> ExporterResult<i64> {
    non_empty(value).map_or(Ok(0), |v| {
        v.parse().map_err(|_| {
            ExporterError::BadRequest(format!("invalid {name} format, must be a valid integer"))
        })
    })
}

impl HistoricalParams {
    /// Returns true if the request selects records by OID range.
    #[must_use]
    pub const fn is_oid_mode(&self) -> bool {
        self.start_oid.is_some()
    }

    /// Resolves the parameters into a record query.
    ///
    /// Missing time bounds default to `lookback` before `now` and `now`.
    /// OID bounds apply only when `start_oid` is present.
    ///
    /// # Errors
    ///
    /// Returns `ExporterError::BadRequest` for an unparsable value, a start
    /// after the end or a `start_oid` above a non-zero `end_oid`.
    pub fn resolve(
        &self,
        timezone: Tz,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> ExporterResult<RecordQuery> {
        let start = match non_empty(self.start.as_ref()) {
            Some(value) => parse_time(value, Bound::Start, timezone)?,
            None => window_start(now, lookback),
        };
        let end = match non_empty(self.end.as_ref()) {
            Some(value) => parse_time(value, Bound::End, timezone)?,
            None => now,
        };
        if start > end {
            return Err(ExporterError::BadRequest(
                "start time must be before end time".into(),
            ));
        }

        let query = RecordQuery::new(start, end);
        if !self.is_oid_mode() {
            return Ok(query);
        }

        let start_oid = parse_oid(self.start_oid.as_ref(), "start_oid")?;
        let end_oid = parse_oid(self.end_oid.as_ref(), "end_oid")?;
        if end_oid > 0 && start_oid > end_oid {
            return Err(ExporterError::BadRequest(
                "start_oid must be less than or equal to end_oid".into(),
            ));
        }
        Ok(query.after_oid(start_oid).until_oid(end_oid))
    }
}

/// Returns true if an `Accept-Encoding` value admits gzip.
#[must_use]
pub fn accepts_gzip(accept_encoding: Option<&HeaderValue>) -> bool {
    accept_encoding
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"))
}

/// Size of the pipe between the replay task and the response body.
const STREAM_BUFFER: usize = 64 * 1024;

/// A historical export whose body is rendered while it streams.
///
/// The replay runs on the blocking pool and writes into a bounded pipe, so
/// memory use stays flat regardless of the window size.
pub struct HistoricalExport {
    body: ReaderStream<DuplexStream>,
    gzip: bool,
    records: usize,
    highest_oid: Option<i64>,
}

impl HistoricalExport {
    /// Returns true if the body is gzip-compressed.
    #[must_use]
    pub const fn is_gzip(&self) -> bool {
        self.gzip
    }

    /// Returns the number of records being replayed.
    #[must_use]
    pub const fn records(&self) -> usize {
        self.records
    }

    /// Returns the highest OID among the replayed records.
    #[must_use]
    pub const fn highest_oid(&self) -> Option<i64> {
        self.highest_oid
    }

    /// Consumes the export and returns its streaming body.
    #[must_use]
    pub fn into_body(self) -> Body {
        Body::from_stream(self.body)
    }
}

impl IntoResponse for HistoricalExport {
    fn into_response(self) -> Response {
        let gzip = self.gzip;
        let highest_oid = self.highest_oid.filter(|oid| *oid > 0);
        let mut response = self.into_body().into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));
        if gzip {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if let Some(oid) = highest_oid {
            headers.insert(HeaderName::from_static(HIGHEST_OID_HEADER), HeaderValue::from(oid));
        }
        response
    }
}

/// Runs a historical export against the state's record source.
///
/// Parameters are validated and records fetched before this returns, so
/// those failures still map to an error status. The body itself is produced
/// after the response has started.
///
/// # Errors
///
/// Returns `ExporterError::BadRequest` for invalid parameters, and a source
/// or timeout error if the records cannot be fetched.
pub async fn export(
    state: &ExporterState,
    params: &HistoricalParams,
    gzip: bool,
) -> ExporterResult<HistoricalExport> {
    let config = state.config();
    let query = params.resolve(config.timezone, config.historical_lookback, Utc::now())?;

    let records = timeout(config.historical_query_timeout, state.source().query(&query))
        .await
        .map_err(|_| ExporterError::Timeout(config.historical_query_timeout.as_secs()))??;

    let export = HistoricalExport {
        records: records.len(),
        highest_oid: highest_oid(&records),
        gzip,
        body: ReaderStream::new(spawn_replay(
            state.replay().clone(),
            records,
            gzip,
            params.is_oid_mode(),
        )),
    };
    Ok(export)
}

/// Starts the replay on the blocking pool and returns the read end of its
/// output pipe.
fn spawn_replay(
    replay: HistoricalReplay,
    records: Vec<MilkingRecord>,
    gzip: bool,
    oid_mode: bool,
) -> DuplexStream {
    let (reader, writer) = tokio::io::duplex(STREAM_BUFFER);
    let sink = SyncIoBridge::new(writer);
    let span = Span::current();

    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        match write_body(&replay, &records, sink, gzip) {
            Ok(summary) => info!(
                records = summary.records,
                partitions = summary.partitions,
                highest_oid = summary.highest_oid,
                oid_mode,
                gzip,
                "collected historical milking metrics"
            ),
            // The reader sees a truncated body; the status line is already out.
            Err(e) => warn!(error = %e, records = records.len(), "historical export aborted"),
        }
    });

    reader
}

/// Replays `records` into `sink`, compressing when requested.
fn write_body(
    replay: &HistoricalReplay,
    records: &[MilkingRecord],
    sink: SyncIoBridge<DuplexStream>,
    gzip: bool,
) -> delpro_metrics::Result<ReplaySummary> {
    let mut out = BufWriter::with_capacity(STREAM_BUFFER, sink);
    let summary = if gzip {
        let mut encoder = GzEncoder::new(&mut out, Compression::default());
        let summary = replay.write(records, &mut encoder)?;
        encoder.finish()?;
        summary
    } else {
        replay.write(records, &mut out)?
    };
    let mut sink = out.into_inner().map_err(IntoInnerError::into_error)?;
    sink.shutdown()?;
    Ok(summary)
}

/// Decompresses a gzip body.
#[cfg(test)]
pub(crate) fn gunzip(body: &[u8]) -> String {
    use std::io::Read;
    let mut out = String::new();
    flate2::read::GzDecoder::new(body)
        .read_to_string(&mut out)
        .unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{Bytes, HttpBody};
    use chrono::TimeDelta;
    use delpro_metrics::MetricSet;
    use delpro_source::{DbSettings, MemorySource};
    use http_body_util::BodyExt;
    use test_case::test_case;

    use crate::config::ExporterConfig;

    const LOOKBACK: Duration = Duration::from_secs(30 * 24 * 3600);

    fn now() -> DateTime<Utc> {
        "2025-03-10T12:00:00Z".parse().unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn params(pairs: &[(&str, &str)]) -> HistoricalParams {
        let mut p = HistoricalParams::default();
        for (key, value) in pairs {
            let value = Some((*value).to_string());
            match *key {
                "start" => p.start = value,
                "end" => p.end = value,
                "start_oid" => p.start_oid = value,
                "end_oid" => p.end_oid = value,
                other => unreachable!("unknown parameter {other}"),
            }
        }
        p
    }

    fn resolve(pairs: &[(&str, &str)]) -> ExporterResult<RecordQuery> {
        params(pairs).resolve(chrono_tz::Europe::Zurich, LOOKBACK, now())
    }

    mod resolve_tests {
        use super::*;
        use test_case::test_case;

        #[test]
        fn defaults_to_lookback_ending_now() {
            let query = resolve(&[]).unwrap();
            assert_eq!(query.start, now() - TimeDelta::days(30));
            assert_eq!(query.end, now());
            assert_eq!(query.after_oid, 0);
            assert_eq!(query.until_oid, None);
        }

        #[test]
        fn empty_values_use_defaults() {
            let query = resolve(&[("start", ""), ("end", "")]).unwrap();
            assert_eq!(query.end, now());
        }

        #[test]
        fn rfc3339_bounds() {
            let query = resolve(&[
                ("start", "2025-03-01T06:00:00Z"),
                ("end", "2025-03-02T08:30:00+01:00"),
            ])
            .unwrap();
            assert_eq!(query.start, utc("2025-03-01T06:00:00Z"));
            assert_eq!(query.end, utc("2025-03-02T07:30:00Z"));
        }

        #[test]
        fn date_bounds_use_database_timezone_in_winter() {
            let query = resolve(&[("start", "2025-03-01"), ("end", "2025-03-01")]).unwrap();
            assert_eq!(query.start, utc("2025-02-28T23:00:00Z"));
            assert_eq!(query.end, utc("2025-03-01T22:59:59.999999999Z"));
        }

        #[test]
        fn date_bounds_use_database_timezone_in_summer() {
            let query = resolve(&[("start", "2024-07-01"), ("end", "2024-07-02")]).unwrap();
            assert_eq!(query.start, utc("2024-06-30T22:00:00Z"));
            assert_eq!(query.end, utc("2024-07-02T21:59:59.999999999Z"));
        }

        #[test]
        fn equal_bounds_are_accepted() {
            let t = "2025-03-01T06:00:00Z";
            let query = resolve(&[("start", t), ("end", t)]).unwrap();
            assert_eq!(query.start, query.end);
        }

        #[test]
        fn oid_range() {
            let query = resolve(&[("start_oid", "5"), ("end_oid", "10")]).unwrap();
            assert_eq!(query.after_oid, 5);
            assert_eq!(query.until_oid, Some(10));
            assert_eq!(query.end, now());
        }

        #[test_case("0" ; "zero")]
        #[test_case("" ; "empty")]
        #[test_case("-3" ; "negative")]
        fn end_oid_unbounded(end_oid: &str) {
            let query = resolve(&[("start_oid", "5"), ("end_oid", end_oid)]).unwrap();
            assert_eq!(query.until_oid, None);
        }

        #[test]
        fn end_oid_without_start_oid_is_ignored() {
            let query = resolve(&[("end_oid", "10")]).unwrap();
            assert_eq!(query.until_oid, None);
        }

        #[test]
        fn empty_start_oid_selects_oid_mode_from_zero() {
            let query = resolve(&[("start_oid", ""), ("end_oid", "10")]).unwrap();
            assert_eq!(query.after_oid, 0);
            assert_eq!(query.until_oid, Some(10));
        }
    }

    mod rejection_tests {
        use super::*;
        use test_case::test_case;

        fn reason(pairs: &[(&str, &str)]) -> String {
            match resolve(pairs).unwrap_err() {
                ExporterError::BadRequest(reason) => reason,
                other => format!("not a bad request: {other}"),
            }
        }

        #[test_case(&[("start", "yesterday")], "invalid start time format" ; "bad start")]
        #[test_case(&[("end", "2025/03/01")], "invalid end time format" ; "bad end")]
        #[test_case(&[("start", "2025-03-02"), ("end", "2025-03-01")], "start time must be before end time" ; "start after end")]
        #[test_case(&[("start_oid", "abc")], "invalid start_oid format" ; "bad start oid")]
        #[test_case(&[("start_oid", "1"), ("end_oid", "x")], "invalid end_oid format" ; "bad end oid")]
        #[test_case(&[("start_oid", "11"), ("end_oid", "10")], "start_oid must be less than or equal to end_oid" ; "oid range inverted")]
        fn rejected(pairs: &[(&str, &str)], expected: &str) {
            assert!(reason(pairs).starts_with(expected));
        }
    }

    #[test_case(None, false ; "absent")]
    #[test_case(Some("identity"), false ; "identity")]
    #[test_case(Some("gzip"), true ; "gzip")]
    #[test_case(Some("br, gzip;q=0.8"), true ; "listed")]
    fn gzip_negotiation(header: Option<&'static str>, expected: bool) {
        let value = header.map(HeaderValue::from_static);
        assert_eq!(accepts_gzip(value.as_ref()), expected);
    }

    mod export_tests {
        use super::*;

        const WINDOW: [(&str, &str); 2] = [
            ("start", "2025-03-01T00:00:00Z"),
            ("end", "2025-03-02T00:00:00Z"),
        ];

        fn state(source: MemorySource) -> ExporterState {
            let config = ExporterConfig::new(DbSettings::new("h", 1433, "DDM", "sa", "pw"));
            ExporterState::new(config, MetricSet::new(), Arc::new(source))
        }

        fn source(count: i64) -> MemorySource {
            let first = utc("2025-03-01T06:00:00Z");
            MemorySource::with_records((1..=count).map(|oid| {
                MilkingRecord::new(oid, "42", first + TimeDelta::minutes(oid), 10.0)
                    .with_animal("Bella", "CH1")
                    .with_duration(400)
            }))
        }

        async fn collect(export: HistoricalExport) -> Bytes {
            export.into_body().collect().await.unwrap().to_bytes()
        }

        #[tokio::test]
        async fn export_reports_highest_oid() {
            let export = export(&state(source(3)), &params(&WINDOW), false)
                .await
                .unwrap();
            assert_eq!(export.highest_oid(), Some(3));
            assert_eq!(export.records(), 3);

            let response = export.into_response();
            assert_eq!(response.headers()[HIGHEST_OID_HEADER], "3");
            assert_eq!(response.headers()[header::CONTENT_TYPE], CONTENT_TYPE);
            assert!(response.headers().get(header::CONTENT_ENCODING).is_none());

            let body = response.into_body().collect().await.unwrap().to_bytes();
            let text = std::str::from_utf8(&body).unwrap();
            assert!(text.contains("delpro_milk_sessions_total{"));
        }

        #[tokio::test]
        async fn gzip_body_matches_plain_body() {
            let state = state(source(3));
            let p = params(&[WINDOW[0], WINDOW[1], ("start_oid", "1")]);

            let plain = collect(export(&state, &p, false).await.unwrap()).await;
            let compressed = export(&state, &p, true).await.unwrap();
            assert!(compressed.is_gzip());
            let compressed = collect(compressed).await;

            assert!(!plain.is_empty());
            assert_eq!(gunzip(&compressed).as_bytes(), &plain[..]);
        }

        #[tokio::test]
        async fn body_streams_in_frames_without_known_length() {
            let export = export(&state(source(200)), &params(&WINDOW), false)
                .await
                .unwrap();
            let mut body = export.into_body();
            assert_eq!(body.size_hint().exact(), None);

            let mut frames = 0;
            let mut streamed = Vec::new();
            while let Some(frame) = body.frame().await {
                let data = frame.unwrap().into_data().unwrap();
                streamed.extend_from_slice(&data);
                frames += 1;
            }

            assert!(frames > 1, "body arrived in {frames} frame");
            let text = String::from_utf8(streamed).unwrap();
            assert!(text.ends_with('\n'));
            assert!(text.lines().all(|line| !line.starts_with('#')));
        }

        #[tokio::test]
        async fn gzip_stream_is_complete() {
            let export = export(&state(source(200)), &params(&WINDOW), true)
                .await
                .unwrap();
            let text = gunzip(&collect(export).await);
            let last_end = (utc("2025-03-01T06:00:00Z") + TimeDelta::minutes(200)).timestamp_millis();
            let suffix = format!(" {last_end}");
            assert!(text.lines().any(|line| line.ends_with(&suffix)));
        }

        #[tokio::test]
        async fn empty_window_has_no_oid_header() {
            let export = export(&state(MemorySource::new()), &params(&WINDOW), false)
                .await
                .unwrap();
            let response = export.into_response();
            assert!(response.headers().get(HIGHEST_OID_HEADER).is_none());

            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert!(body.is_empty());
        }

        #[tokio::test]
        async fn source_failure_is_an_error() {
            let source = source(3);
            source.set_failure(Some("deadlock victim"));
            let result = export(&state(source), &params(&WINDOW), false).await;
            assert!(matches!(result, Err(ExporterError::Source(_))));
        }
    }
}
