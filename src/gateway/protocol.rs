//! Gateway wire format: JSON text frames `{op, d, s, t}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::GatewayError;

/// Gateway opcodes used by the session.
pub mod opcode {
    pub const DISPATCH: u64 = 0;
    pub const HEARTBEAT: u64 = 1;
    pub const IDENTIFY: u64 = 2;
    pub const RECONNECT: u64 = 7;
    pub const INVALID_SESSION: u64 = 9;
    pub const HELLO: u64 = 10;
    pub const HEARTBEAT_ACK: u64 = 11;
}

/// Dispatch event names the session reacts to.
pub mod event {
    pub const READY: &str = "READY";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u64,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// A decoded frame, classified by opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    Hello(Hello),
    HeartbeatAck,
    HeartbeatRequest,
    Dispatch { event: String, data: Value },
    Reconnect,
    InvalidSession,
    Unknown(u64),
}

impl GatewayFrame {
    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::Protocol(format!("bad frame: {e}")))
    }

    /// Serialize for sending.
    pub fn encode(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Protocol(e.to_string()))
    }

    /// Classify by opcode. A Hello without `heartbeat_interval` is a protocol error.
    pub fn kind(&self) -> Result<FrameKind, GatewayError> {
        Ok(match self.op {
            opcode::HELLO => {
                let hello: Hello = serde_json::from_value(self.d.clone())
                    .map_err(|e| GatewayError::Protocol(format!("bad hello payload: {e}")))?;
                FrameKind::Hello(hello)
            }
            opcode::HEARTBEAT_ACK => FrameKind::HeartbeatAck,
            opcode::HEARTBEAT => FrameKind::HeartbeatRequest,
            opcode::DISPATCH => FrameKind::Dispatch {
                event: self.t.clone().unwrap_or_default(),
                data: self.d.clone(),
            },
            opcode::RECONNECT => FrameKind::Reconnect,
            opcode::INVALID_SESSION => FrameKind::InvalidSession,
            other => FrameKind::Unknown(other),
        })
    }

    /// `{"op":1,"d":<seq|null>}`
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: opcode::HEARTBEAT,
            d: sequence.map_or(Value::Null, Value::from),
            s: None,
            t: None,
        }
    }

    /// Identify with the bot token, intents bitmask, and client properties.
    pub fn identify(token: &str, intents: u64, client_name: &str) -> Self {
        Self {
            op: opcode::IDENTIFY,
            d: json!({
                "token": token,
                "intents": intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": client_name,
                    "device": client_name,
                },
            }),
            s: None,
            t: None,
        }
    }
}

/// Payload of op 10.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// Payload of the `READY` dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub user: GatewayUser,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
}

/// Payload of the `MESSAGE_CREATE` dispatch. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCreate {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub author: GatewayUser,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}
