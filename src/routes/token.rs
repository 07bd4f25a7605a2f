//! Downstream token handover.
//!
//! The OAuth exchange happens elsewhere; it hands the resulting access token
//! to `PUT /api/auth/token`. `GET` reports whether one is stored and `DELETE`
//! revokes it.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ApiError};
use crate::error::TokenError;
use crate::AppState;

#[derive(Deserialize)]
pub struct SaveTokenRequest {
    pub access_token: String,
}

/// `GET /api/auth/token`
pub async fn get_token(State(state): State<AppState>) -> Json<Value> {
    let record = state.tokens.load().await;
    Json(json!({
        "authenticated": record.is_some(),
        "obtained_at": record.map(|r| r.obtained_at),
    }))
}

/// `PUT /api/auth/token`
pub async fn put_token(
    State(state): State<AppState>,
    Json(body): Json<SaveTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    match state.tokens.save(&body.access_token).await {
        Ok(record) => Ok(Json(json!({
            "authenticated": true,
            "obtained_at": record.obtained_at,
        }))),
        Err(e @ TokenError::Empty) => Err(api_error(StatusCode::BAD_REQUEST, "INVALID_TOKEN", e)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e)),
    }
}

/// `DELETE /api/auth/token`
pub async fn delete_token(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let revoked = state
        .tokens
        .revoke()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", e))?;
    Ok(Json(json!({ "authenticated": false, "revoked": revoked })))
}
