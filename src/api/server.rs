//! Axum API server for the usage service.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::cache::UsageClient;
use crate::config::ServerConfig;
use crate::error::{FreeTierError, Result};
use crate::metrics::ServiceMetrics;

/// Request bodies are a handful of short strings.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<UsageClient>,
    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    pub fn new(client: Arc<UsageClient>) -> Self {
        let metrics = client.metrics().clone();
        Self { client, metrics }
    }
}

fn cors_layer(origin: Option<&str>) -> Result<CorsLayer> {
    let allow_origin = match origin {
        Some(o) => AllowOrigin::exact(
            o.parse::<HeaderValue>()
                .map_err(|e| FreeTierError::Config(format!("invalid cors_origin '{o}': {e}")))?,
        ),
        None => AllowOrigin::any(),
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static("content-type")]))
}

/// Build the axum router with all API routes.
pub fn build_router(state: AppState, cors_origin: Option<&str>) -> Result<Router> {
    let shared_state = Arc::new(state);

    let router = Router::new()
        .route(
            "/api/check-usage",
            post(super::routes::usage::check_usage),
        )
        .route("/api/health", get(super::routes::health::get_health))
        .route("/api/metrics", get(super::routes::metrics::get_metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer(cors_origin)?)
        .layer(TraceLayer::new_for_http())
        .with_state(shared_state);
    Ok(router)
}

/// Start the API server and run until Ctrl-C.
pub async fn start_server(config: &ServerConfig, state: AppState) -> Result<()> {
    let metrics = state.metrics.clone();
    let app = build_router(state, config.cors_origin.as_deref())?;
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Usage API listening on {addr}");
    metrics.set_ready(true);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {e}");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    metrics.set_ready(false);
    Ok(())
}

/// In-memory state for handler tests.
#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    test_state_with(
        Arc::new(crate::entitlement::MemoryEntitlementStore::new()),
        Arc::new(crate::ledger::MemoryCounterStore::new()),
        5,
    )
}

#[cfg(test)]
pub(crate) fn test_state_with(
    entitlements: Arc<dyn crate::entitlement::EntitlementStore>,
    counters: Arc<dyn crate::ledger::CounterStore>,
    cap: u32,
) -> AppState {
    use crate::cache::UsageCache;
    use crate::clock::DayResolver;
    use crate::entitlement::EntitlementGate;
    use crate::ledger::{DailyCaps, QuotaLedger};
    use std::time::Duration;

    let gate = Arc::new(EntitlementGate::new(entitlements, Duration::from_secs(15)));
    let ledger = Arc::new(QuotaLedger::new(
        gate,
        counters,
        DayResolver::system(-360).expect("valid offset"),
        DailyCaps::uniform(cap),
    ));
    let client = UsageClient::new(
        ledger,
        UsageCache::new(UsageCache::DEFAULT_TTL, 100),
        Arc::new(ServiceMetrics::new()),
    );
    AppState::new(Arc::new(client))
}
