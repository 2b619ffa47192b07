//! Metrics route.

use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::api::server::AppState;
use crate::metrics::MetricsSnapshot;

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
