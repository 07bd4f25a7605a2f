//! Stored message endpoints.
//!
//! - `GET /api/messages?limit=N&channel_id=C` — most recent first (default 50, max 200)
//! - `GET /api/messages/failed` — Failed records within retention
//! - `GET /api/messages/stats` — counts and success rate
//! - `POST /api/messages/retry` — re-run undelivered records through the pipeline
//! - `POST /api/messages/simulate` — inject a synthetic message event

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{api_error, ApiError};
use crate::gateway::protocol::GatewayUser;
use crate::gateway::MessageCreate;
use crate::pipeline::ProcessOutcome;
use crate::AppState;

/// Query parameters for `GET /api/messages`.
#[derive(Deserialize)]
pub struct MessagesQuery {
    /// Maximum number of records to return. Defaults to 50, max 200.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Only records from this source channel.
    pub channel_id: Option<String>,
}

/// Body of `POST /api/messages/simulate`.
#[derive(Deserialize)]
pub struct SimulateRequest {
    pub channel_id: String,
    pub username: String,
    pub content: String,
    #[serde(default)]
    pub guild_id: Option<String>,
}

fn default_limit() -> usize {
    50
}

pub async fn recent(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Json<Value> {
    let limit = query.limit.min(200);
    let messages = match query.channel_id.as_deref() {
        Some(channel_id) => state.store.list_by_channel(channel_id, limit).await,
        None => state.store.list_recent(limit).await,
    };
    Json(json!({ "messages": messages }))
}

pub async fn failed(State(state): State<AppState>) -> Json<Value> {
    let messages = state.store.list_failed().await;
    Json(json!({ "count": messages.len(), "messages": messages }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.store.stats().await))
}

pub async fn retry(State(state): State<AppState>) -> Json<Value> {
    let results = state.bridge.pipeline().retry_failed().await;
    let delivered = results
        .iter()
        .filter(|r| matches!(r.outcome, ProcessOutcome::Delivered { .. }))
        .count();
    Json(json!({
        "attempted": results.len(),
        "delivered": delivered,
        "results": results,
    }))
}

/// Run a synthetic message through the same pipeline as gateway events.
pub async fn simulate(
    State(state): State<AppState>,
    Json(body): Json<SimulateRequest>,
) -> Result<Json<Value>, ApiError> {
    for (field, value) in [
        ("channel_id", &body.channel_id),
        ("username", &body.username),
        ("content", &body.content),
    ] {
        if value.trim().is_empty() {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                format!("{field} must not be empty"),
            ));
        }
    }

    let event = MessageCreate {
        id: simulated_id(),
        channel_id: body.channel_id,
        guild_id: body.guild_id,
        author: GatewayUser {
            id: "simulated".to_string(),
            username: body.username,
            discriminator: Some("0001".to_string()),
            global_name: None,
            bot: false,
        },
        content: body.content,
        timestamp: Utc::now(),
        attachments: Vec::new(),
    };
    info!(message_id = %event.id, channel_id = %event.channel_id, "simulated message");
    let outcome = state.bridge.pipeline().process(&event).await;
    Ok(Json(json!({ "message_id": event.id, "result": outcome })))
}

/// Millisecond timestamp plus a process-local counter.
fn simulated_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sim-{}-{n}", Utc::now().timestamp_millis())
}
