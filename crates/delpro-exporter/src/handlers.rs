//! HTTP request handlers for the exporter.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::response::{Html, IntoResponse, Response};

use delpro_metrics::CONTENT_TYPE;

use crate::error::ExporterResult;
use crate::historical::{accepts_gzip, export, HistoricalExport, HistoricalParams};
use crate::state::ExporterState;

const INDEX_PAGE: &str = r#"<html>
<head><title>DelPro Exporter</title></head>
<body>
<h1>DelPro Exporter</h1>
<p><a href="/metrics">Metrics</a></p>
<p><a href="/historical-metrics">Historical Metrics</a></p>
</body>
</html>
"#;

/// Handle GET / - landing page.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Handle GET /metrics - live series without timestamps.
pub async fn metrics(State(state): State<Arc<ExporterState>>) -> Response {
    let body = state.live().encode();
    (
        [(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE))],
        body,
    )
        .into_response()
}

/// Handle GET /historical-metrics - timestamped replay of a window.
pub async fn historical_metrics(
    State(state): State<Arc<ExporterState>>,
    Query(params): Query<HistoricalParams>,
    headers: HeaderMap,
) -> ExporterResult<HistoricalExport> {
    let gzip = accepts_gzip(headers.get(header::ACCEPT_ENCODING));
    export(&state, &params, gzip).await
}
