//! End-to-end tests: live cycles against an in-memory source, and the
//! historical endpoint driven through the router.

use std::io::Read;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use http_body_util::BodyExt;
use tower::ServiceExt;

use delpro_exporter::{ExporterConfig, ExporterServer, LiveUpdater, OidCursor};
use delpro_metrics::{Metric, MetricSet, MilkingRecord, SeriesKey};
use delpro_source::{DbSettings, MemorySource};

fn day(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).single().unwrap()
}

fn config() -> ExporterConfig {
    ExporterConfig::new(DbSettings::new("localhost", 1433, "DDM", "sa", "secret"))
}

fn animal_a(oid: i64, end: DateTime<Utc>, yield_liters: f64) -> MilkingRecord {
    MilkingRecord::new(oid, "17", end, yield_liters)
        .with_animal("Alma", "CH120.1234.5678.9")
        .with_breed("Holstein")
        .with_device("1")
        .with_destination("Tank")
        .with_lactation(3, 120)
        .with_duration(420)
}

fn scenario() -> MemorySource {
    MemorySource::with_records([
        animal_a(101, day(1, 9), 10.0),
        animal_a(102, day(1, 17), 12.0),
        animal_a(103, day(2, 9), 11.0),
    ])
}

fn series(metric: Metric) -> SeriesKey {
    animal_a(0, day(1, 0), 0.0).label_key().series(metric)
}

/// Observation count of animal A's duration histogram, read from the scrape.
fn duration_count(set: &MetricSet) -> Option<u64> {
    let labels = animal_a(0, day(1, 0), 0.0).label_key().to_string();
    let prefix = format!("{}_count{{{labels}}} ", Metric::MilkingDuration.name());
    set.encode()
        .lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|value| value.parse().unwrap())
}

fn updater(source: &MemorySource, set: &MetricSet, dir: &tempfile::TempDir) -> LiveUpdater {
    let cursor = OidCursor::load(dir.path().join("delpro_last_oid.txt"));
    LiveUpdater::new(Arc::new(source.clone()), set.clone(), cursor, &config())
}

#[tokio::test]
async fn live_cycles_count_each_session_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = scenario();
    let set = MetricSet::new();
    let mut updater = updater(&source, &set, &dir);

    let first = updater.run_cycle(day(1, 17) + TimeDelta::minutes(10)).await.unwrap();
    assert_eq!(first.records, 2);
    assert_eq!(first.last_oid, 102);

    let second = updater.run_cycle(day(2, 9) + TimeDelta::minutes(10)).await.unwrap();
    assert_eq!(second.records, 1);
    assert_eq!(second.last_oid, 103);

    // cursor already at 103
    let third = updater.run_cycle(day(2, 9) + TimeDelta::minutes(10)).await.unwrap();
    assert_eq!(third.records, 0);

    assert_eq!(set.counter(&series(Metric::MilkSessions)), Some(3));
    assert_eq!(set.gauge(&series(Metric::YieldTotal)), Some(33.0));
    assert_eq!(set.gauge(&series(Metric::LastYield)), Some(11.0));
    assert_eq!(duration_count(&set), Some(3));
}

#[tokio::test]
async fn restart_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = scenario();
    let now = day(2, 9) + TimeDelta::minutes(10);

    let mut before = updater(&source, &MetricSet::new(), &dir);
    before.run_cycle(now).await.unwrap();
    drop(before);

    let set = MetricSet::new();
    let mut after = updater(&source, &set, &dir);
    assert_eq!(after.cursor().last_oid(), 103);

    let outcome = after.run_cycle(now).await.unwrap();
    assert_eq!(outcome.records, 0);
    assert_eq!(set.counter(&series(Metric::MilkSessions)), None);
}

#[tokio::test]
async fn initialization_then_live_update() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = scenario();
    let set = MetricSet::new();
    let mut updater = updater(&source, &set, &dir);

    let now = day(2, 9) + TimeDelta::minutes(10);
    assert_eq!(updater.initialize_counters(now).await.unwrap(), 1);
    assert_eq!(set.counter(&series(Metric::MilkSessions)), Some(0));

    updater.run_cycle(now).await.unwrap();
    // day 1 09:00 falls outside the settled window
    assert_eq!(set.counter(&series(Metric::MilkSessions)), Some(2));
    assert_eq!(set.gauge(&series(Metric::YieldTotal)), Some(23.0));
}

mod historical {
    use super::*;

    /// Window covering every record of [`range_source`].
    const WINDOW: &str = "start=2025-03-03T00:00:00Z&end=2025-03-04T00:00:00Z";

    fn range_source() -> MemorySource {
        let base = day(3, 0);
        MemorySource::with_records(
            (5..=11).map(|oid| animal_a(oid, base + TimeDelta::minutes(oid * 30), 9.5)),
        )
    }

    fn router(source: MemorySource) -> axum::Router {
        ExporterServer::new(config(), MetricSet::new(), Arc::new(source)).router()
    }

    async fn send(
        source: MemorySource,
        uri: &str,
        gzip: bool,
    ) -> (StatusCode, Option<String>, Vec<u8>) {
        let mut request = Request::builder().uri(uri);
        if gzip {
            request = request.header(header::ACCEPT_ENCODING, "gzip");
        }
        let response = router(source)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let highest = response
            .headers()
            .get("X-Highest-OID")
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, highest, body)
    }

    /// `(name, value, timestamp)` of every sample line.
    fn samples(body: &[u8]) -> Vec<(String, String, i64)> {
        std::str::from_utf8(body)
            .unwrap()
            .lines()
            .map(|line| {
                let mut parts = line.rsplitn(3, ' ');
                let ts = parts.next().unwrap().parse().unwrap();
                let value = parts.next().unwrap().to_string();
                let series = parts.next().unwrap();
                let name = series.split('{').next().unwrap().to_string();
                (name, value, ts)
            })
            .collect()
    }

    #[tokio::test]
    async fn oid_range_selects_six_through_ten() {
        let uri = format!("/historical-metrics?{WINDOW}&start_oid=5&end_oid=10");
        let (status, highest, body) = send(range_source(), &uri, false).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(highest.as_deref(), Some("10"));

        let last_yield_points: Vec<i64> = samples(&body)
            .into_iter()
            .filter(|(name, _, _)| name == Metric::LastYield.name())
            .map(|(_, _, ts)| ts)
            .collect();
        let base = last_yield_points[0];
        let offsets: Vec<i64> = last_yield_points.iter().map(|ts| (ts - base) / 60_000).collect();
        assert_eq!(offsets, [0, 30, 60, 90, 120]);
    }

    #[tokio::test]
    async fn brackets_surround_the_replayed_series() {
        let uri = format!("/historical-metrics?{WINDOW}");
        let (_, _, body) = send(range_source(), &uri, false).await;
        let sessions: Vec<(String, String, i64)> = samples(&body)
            .into_iter()
            .filter(|(name, _, _)| name == Metric::MilkSessions.name())
            .collect();

        assert_eq!(sessions.len(), 9);
        let (first, last) = (&sessions[0], &sessions[8]);
        assert_eq!(first.1, "0");
        assert_eq!(last.1, "0");
        assert_eq!(sessions[1].2 - first.2, 10 * 60 * 1000);
        assert_eq!(last.2 - sessions[7].2, 10 * 60 * 1000);
        assert_eq!(sessions[7].1, "7");
    }

    #[tokio::test]
    async fn gzip_body_is_identical_after_decompression() {
        let source = range_source();
        let uri = format!("/historical-metrics?{WINDOW}&start_oid=6");
        let (_, plain_oid, plain) = send(source.clone(), &uri, false).await;
        let (status, gzip_oid, compressed) = send(source, &uri, true).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(plain_oid.as_deref(), Some("11"));
        assert_eq!(plain_oid, gzip_oid);
        assert!(!plain.is_empty());
        assert_ne!(compressed, plain);

        let mut decompressed = Vec::new();
        flate2::read::GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decompressed)
            .unwrap();
        assert_eq!(decompressed, plain);
    }

    #[tokio::test]
    async fn rejected_parameters_do_not_query_the_source() {
        let source = range_source();
        let (status, _, body) =
            send(source.clone(), "/historical-metrics?start_oid=10&end_oid=5", false).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, b"start_oid must be less than or equal to end_oid");
        assert!(source.queries().is_empty());
    }
}
