//! `freetier serve`: run the HTTP API.

use anyhow::{Context, Result};

use freetier::api::server::{start_server, AppState};
use freetier::config::Config;

use super::common::build_client;

pub(crate) async fn cmd_serve(
    mut config: Config,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(b) = bind {
        config.server.bind = b;
    }
    if let Some(p) = port {
        config.server.port = p;
    }

    let client = build_client(&config)?;
    let state = AppState::new(client.clone());

    tracing::info!(
        solve_cap = config.caps.solve,
        quiz_cap = config.caps.quiz,
        transcribe_cap = config.caps.transcribe,
        utc_offset_minutes = config.utc_offset_minutes,
        "Starting usage service"
    );

    let result = start_server(&config.server, state)
        .await
        .with_context(|| format!("API server on {} failed", config.server.addr()));
    client.metrics().emit_usage("shutdown");
    result
}
