//! Bridge status endpoint.
//!
//! `GET /api/status` — session snapshot, recent connection events, downstream
//! auth state, and message statistics in one call for the admin UI poller.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::status::format_ago;
use crate::AppState;

/// Number of connection events included in the response.
const RECENT_EVENTS: usize = 10;

pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let bridge = state.bridge.status().await;
    let recent_events: Vec<Value> = state
        .status
        .recent_events(RECENT_EVENTS)
        .await
        .iter()
        .map(|e| {
            json!({
                "time": format_ago(e.at),
                "at": e.at,
                "event": e.kind.as_str(),
                "detail": e.detail,
            })
        })
        .collect();

    Json(json!({
        "bot": bridge,
        "recent_events": recent_events,
        "auth": { "authenticated": state.tokens.has_valid_token().await },
        "messages": state.store.stats().await,
        "routes": state.config.channels.len(),
    }))
}
