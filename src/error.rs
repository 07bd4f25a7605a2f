//! Error types for the gateway session, the message store, the token store,
//! and downstream delivery.
//!
//! Each concern gets its own enum so callers can tell a contained failure
//! (protocol, storage) from one that changes control flow (fatal start
//! failure, auth expiry).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of the gateway connection and its handshake.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connect/read/write failure on the socket.
    #[error("transport error: {0}")]
    Transport(String),
    /// The discovery endpoint did not yield a usable gateway URL.
    #[error("gateway discovery failed: {0}")]
    Discovery(String),
    /// A frame could not be decoded or had an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Connecting → Ready did not complete in time.
    #[error("handshake did not complete within {0}s")]
    HandshakeTimeout(u64),
    /// Consecutive connection attempts all failed; the start is abandoned.
    #[error("giving up after {attempts} failed connection attempts: {last}")]
    HandshakeFailed { attempts: u32, last: String },
    /// The session cannot start with the current configuration.
    #[error("gateway not configured: {0}")]
    NotConfigured(String),
}

/// Failures of the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    /// The record was never stored or has been evicted by retention.
    #[error("message {0} not found")]
    NotFound(String),
}

/// Failures of the token store.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token file I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("token encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("token must not be empty")]
    Empty,
}

/// Tag stored alongside a failed delivery so callers can tell auth problems
/// from downstream errors without parsing the description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unauthenticated,
    AuthExpired,
    RequestFailed,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AuthExpired => "auth_expired",
            Self::RequestFailed => "request_failed",
        }
    }
}

/// Outcome of a failed call to the downstream chat API.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No token is stored; nothing was sent.
    #[error("no downstream token, authenticate first")]
    Unauthenticated,
    /// The API answered 401; the stored token has been revoked.
    #[error("downstream token invalid or expired (401), token revoked")]
    AuthExpired,
    /// Any other non-2xx answer or a transport failure.
    #[error("downstream request failed{}: {body}", status_suffix(*.status))]
    RequestFailed { status: Option<u16>, body: String },
}

impl ForwardError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Unauthenticated => FailureKind::Unauthenticated,
            Self::AuthExpired => FailureKind::AuthExpired,
            Self::RequestFailed { .. } => FailureKind::RequestFailed,
        }
    }
}

fn status_suffix(status: Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}
