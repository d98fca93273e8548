//! Route configuration for the exporter.

use std::sync::Arc;

use axum::routing::{get, Router};
use tower_http::trace::TraceLayer;

use crate::handlers::{historical_metrics, index, metrics};
use crate::state::ExporterState;

/// Create the exporter router.
pub fn create_router(state: Arc<ExporterState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/historical-metrics", get(historical_metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
