//! Health endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::server::AppState;

/// GET /api/health: liveness plus readiness flag.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let ready = state.metrics.snapshot().ready;
    Json(json!({
        "status": if ready { "ok" } else { "starting" },
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::server::test_state;

    #[tokio::test]
    async fn test_get_health_reports_readiness() {
        let state = Arc::new(test_state());
        let Json(body) = get_health(State(state.clone())).await;
        assert_eq!(body["status"], "starting");
        assert!(body["version"].is_string());

        state.metrics.set_ready(true);
        let Json(body) = get_health(State(state)).await;
        assert_eq!(body["status"], "ok");
    }
}
