//! Delivery of stored messages to the downstream chat API.
//!
//! ## Authentication
//!
//! Requests carry the bearer token from [`TokenStore`]. With no token stored
//! nothing is sent and the caller gets [`ForwardError::Unauthenticated`]. A 401
//! answer revokes the stored token before [`ForwardError::AuthExpired`] is
//! returned, so later deliveries short-circuit until a new token is saved.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::ForwardConfig;
use crate::error::ForwardError;
use crate::store::StoredMessage;
use crate::token::TokenStore;

/// HTTP client for the downstream chat API.
#[derive(Debug, Clone)]
pub struct Forwarder {
    http: reqwest::Client,
    api_base: String,
    workspace_id: String,
    tokens: Arc<TokenStore>,
}

impl Forwarder {
    pub fn new(config: &ForwardConfig, tokens: Arc<TokenStore>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            // Strip trailing slash for consistent URL construction
            api_base: config.api_base.trim_end_matches('/').to_string(),
            workspace_id: config.workspace_id.clone(),
            tokens,
        })
    }

    /// `POST /api/v3/workspaces/{ws}/chat/channels/{dest}/messages`
    pub fn message_url(&self, destination: &str) -> String {
        format!(
            "{}/api/v3/workspaces/{}/chat/channels/{}/messages",
            self.api_base, self.workspace_id, destination
        )
    }

    /// Send one message. Returns the destination message id when the API reports one.
    pub async fn deliver(
        &self,
        message: &StoredMessage,
        destination: &str,
    ) -> Result<Option<String>, ForwardError> {
        let Some(token) = self.tokens.bearer().await else {
            return Err(ForwardError::Unauthenticated);
        };

        let resp = self
            .http
            .post(self.message_url(destination))
            .bearer_auth(token)
            .json(&json!({ "content": format_message(message) }))
            .send()
            .await
            .map_err(|e| ForwardError::RequestFailed {
                status: None,
                body: e.to_string(),
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            warn!(message_id = %message.id, "downstream API rejected token, revoking");
            if let Err(e) = self.tokens.revoke().await {
                warn!("failed to remove revoked token file: {e}");
            }
            return Err(ForwardError::AuthExpired);
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ForwardError::RequestFailed {
                status: Some(status.as_u16()),
                body,
            });
        }

        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let id = match &body["id"] {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        debug!(message_id = %message.id, destination, "delivered");
        Ok(id)
    }
}

/// Deep link back to the source message.
pub fn message_link(message: &StoredMessage) -> String {
    format!(
        "https://discord.com/channels/{}/{}/{}",
        message.guild_id.as_deref().unwrap_or("@me"),
        message.channel_id,
        message.id
    )
}

/// `name#1234`, or the bare name when the discriminator is absent or `"0"`.
pub fn author_display(message: &StoredMessage) -> String {
    match message.author_discriminator.as_deref() {
        Some(d) if !d.is_empty() && d != "0" => format!("{}#{d}", message.author_name),
        _ => message.author_name.clone(),
    }
}

/// Markdown body posted to the destination channel.
pub fn format_message(message: &StoredMessage) -> String {
    let mut out = String::new();
    out.push_str("📨 **New Discord Message**\n\n");
    let _ = writeln!(out, "**User**: {}", author_display(message));
    let _ = writeln!(
        out,
        "**Time**: {}",
        message.source_timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "**Message**: {}", message.content);
    let _ = writeln!(out, "🔗 [View message in Discord]({})", message_link(message));
    if !message.attachments.is_empty() {
        out.push_str("\n📎 Attachments:\n");
        for a in &message.attachments {
            let _ = writeln!(out, "- [{}]({})", a.filename, a.url);
        }
    }
    out
}
