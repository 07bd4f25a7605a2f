//! Gateway session control.
//!
//! `POST /api/bot/start` and `POST /api/bot/stop`. Both are idempotent: starting
//! a running session or stopping a stopped one reports that and succeeds.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

use super::{api_error, ApiError};
use crate::error::GatewayError;
use crate::AppState;

/// `POST /api/bot/start`
pub async fn start(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.bridge.start().await {
        Ok(outcome) => {
            info!(?outcome, "bot start requested via API");
            Ok(Json(json!({ "result": outcome })))
        }
        Err(e @ GatewayError::NotConfigured(_)) => {
            Err(api_error(StatusCode::CONFLICT, "NOT_CONFIGURED", e))
        }
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "START_FAILED", e)),
    }
}

/// `POST /api/bot/stop`
pub async fn stop(State(state): State<AppState>) -> Json<Value> {
    let outcome = state.bridge.stop().await;
    info!(?outcome, "bot stop requested via API");
    Json(json!({ "result": outcome }))
}
