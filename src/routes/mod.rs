//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware.

use axum::http::StatusCode;
use axum::{
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::AppState;

pub mod bot;
pub mod health;
pub mod messages;
pub mod status;
pub mod token;

/// Error response shape shared by all handlers.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, code: &str, error: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": error.to_string(), "code": code })))
}

/// Build the full API router: public health probe plus the authenticated endpoints.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/status", get(status::status))
        .route("/api/bot/start", post(bot::start))
        .route("/api/bot/stop", post(bot::stop))
        .route("/api/messages", get(messages::recent))
        .route("/api/messages/failed", get(messages::failed))
        .route("/api/messages/stats", get(messages::stats))
        .route("/api/messages/retry", post(messages::retry))
        .route("/api/messages/simulate", post(messages::simulate))
        .route(
            "/api/auth/token",
            get(token::get_token)
                .put(token::put_token)
                .delete(token::delete_token),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
