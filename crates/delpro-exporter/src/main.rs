//! delpro-exporter - Prometheus exporter for DelPro milking sessions.
//!
//! Connects to the DelPro SQL Server database, keeps a live metric set up to
//! date and serves it together with the historical replay endpoint.

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use delpro_exporter::{Cli, ExporterServer, LiveUpdater, LogFormat, OidCursor};
use delpro_metrics::MetricSet;
use delpro_source::{RecordSource, SqlServerSource};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal in production.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "starting DelPro exporter");

    let config = cli.into_config()?;
    info!(
        host = %config.db.address(),
        database = %config.db.database,
        timezone = %config.timezone,
        oid_file = %config.oid_file.display(),
        "configuration loaded"
    );

    let source: Arc<dyn RecordSource> =
        Arc::new(SqlServerSource::connect(config.db.clone(), config.timezone).await?);

    let live = MetricSet::new();
    let cursor = OidCursor::load(&config.oid_file);
    let mut updater = LiveUpdater::new(source.clone(), live.clone(), cursor, &config);
    if let Err(e) = updater.initialize_counters(Utc::now()).await {
        warn!(error = %e, "failed to initialize counters");
    }
    updater.apply_floor(config.oid_floor);
    info!(
        last_oid = updater.cursor().last_oid(),
        interval_secs = config.update_interval.as_secs(),
        "starting live updates"
    );

    let live_task = tokio::spawn(updater.run(shutdown_signal()));

    let server = ExporterServer::new(config.clone(), live, source);
    server
        .serve_with_shutdown(config.listen_addr, shutdown_signal())
        .await?;

    live_task.abort();
    Ok(())
}
