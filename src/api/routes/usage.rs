//! `POST /api/check-usage`: allowance check and use recording.
//!
//! Without an `action` the call is a read-only check. With `"action": "use"`
//! one unit is recorded; an exhausted allowance answers 429 with the same
//! snapshot shape so clients can route to the upgrade prompt.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::server::AppState;
use crate::error::{FreeTierError, Result};
use crate::identity::Identity;
use crate::ledger::{Feature, UsageSnapshot};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckUsageRequest {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    /// Metered feature; `solve` when absent.
    pub feature: Option<String>,
    /// `"use"` to record a unit; absent or `"check"` to only read.
    pub action: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Check,
    Use,
}

impl CheckUsageRequest {
    fn operation(&self) -> Result<Operation> {
        match self.action.as_deref().map(str::trim) {
            None | Some("") | Some("check") => Ok(Operation::Check),
            Some("use") => Ok(Operation::Use),
            Some(other) => Err(FreeTierError::InvalidInput(format!(
                "unknown action '{other}'"
            ))),
        }
    }

    fn feature(&self) -> Result<Feature> {
        match self.feature.as_deref() {
            None => Ok(Feature::default()),
            Some(name) => name.parse(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub can_use: bool,
    #[serde(flatten)]
    pub snapshot: UsageSnapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UseResponse {
    pub success: bool,
    #[serde(flatten)]
    pub snapshot: UsageSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

pub async fn check_usage(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<CheckUsageRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            return (status, Json(json!({ "error": rejection.body_text() }))).into_response();
        }
    };

    match handle(&state, &req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn handle(state: &AppState, req: &CheckUsageRequest) -> Result<Response> {
    let operation = req.operation()?;
    let feature = req.feature()?;
    let identity = Identity::from_parts(req.user_id.as_deref(), req.device_id.as_deref())?;

    match operation {
        Operation::Check => {
            let check = state.client.get_usage(&identity, feature).await?;
            Ok(Json(CheckResponse {
                can_use: check.allowed,
                snapshot: check.snapshot,
            })
            .into_response())
        }
        Operation::Use => {
            let grant = state.client.record_use(&identity, feature).await?;
            let status = if grant.success {
                StatusCode::OK
            } else {
                StatusCode::TOO_MANY_REQUESTS
            };
            let body = UseResponse {
                success: grant.success,
                snapshot: grant.snapshot,
                error: (!grant.success).then_some("daily limit reached"),
            };
            Ok((status, Json(body)).into_response())
        }
    }
}
