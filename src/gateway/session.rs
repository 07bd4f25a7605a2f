//! Gateway protocol state machine.
//!
//! [`GatewaySession::handle`] consumes one [`SessionEvent`] and returns the
//! [`Action`]s the driver must perform. It owns no socket and no timer, so
//! every transition can be exercised directly in tests.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::protocol::{event, FrameKind, GatewayFrame, MessageCreate, Ready};

/// Shortest heartbeat interval accepted from Hello.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Ready,
    Reconnecting,
    Closing,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport finished connecting.
    Connected,
    /// A text frame arrived.
    FrameReceived(String),
    /// The heartbeat timer fired.
    HeartbeatDue,
    /// The peer closed the transport or the stream ended.
    TransportClosed { code: Option<u16>, reason: String },
    StopRequested,
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Send(GatewayFrame),
    /// (Re)arm the periodic heartbeat timer.
    ArmHeartbeat(Duration),
    /// Hand a message event to the delivery worker.
    Deliver(Box<MessageCreate>),
    /// Drop this connection and start a new one.
    Reconnect { cause: ReconnectCause },
    /// Close the transport and stop.
    Close { reason: String },
}

/// Why the session asked for a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectCause {
    /// op 7 from the gateway.
    Requested,
    /// op 9 from the gateway.
    InvalidSession,
    /// The previous heartbeat was never acknowledged.
    HeartbeatMissed,
    /// Hello carried an unusable heartbeat interval (milliseconds).
    BadHeartbeatInterval(u64),
}

impl std::fmt::Display for ReconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("gateway requested reconnect"),
            Self::InvalidSession => f.write_str("invalid session"),
            Self::HeartbeatMissed => f.write_str("heartbeat not acknowledged"),
            Self::BadHeartbeatInterval(ms) => write!(f, "unusable heartbeat interval {ms}ms"),
        }
    }
}

/// Values sent in Identify and used for filtering.
#[derive(Clone)]
pub struct SessionSettings {
    pub bot_token: String,
    pub intents: u64,
    pub client_name: String,
    pub ignore_bots: bool,
}

impl std::fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSettings")
            .field("bot_token", &"[REDACTED]")
            .field("intents", &self.intents)
            .field("client_name", &self.client_name)
            .field("ignore_bots", &self.ignore_bots)
            .finish()
    }
}

/// Single owned session state.
#[derive(Debug)]
pub struct GatewaySession {
    settings: SessionSettings,
    phase: Phase,
    sequence: Option<u64>,
    session_id: Option<String>,
    username: Option<String>,
    heartbeat_interval: Option<Duration>,
    last_heartbeat: Option<DateTime<Utc>>,
    awaiting_ack: bool,
    heartbeats_sent: u64,
    close_code: Option<u16>,
    last_error: Option<String>,
}

impl GatewaySession {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            phase: Phase::Disconnected,
            sequence: None,
            session_id: None,
            username: None,
            heartbeat_interval: None,
            last_heartbeat: None,
            awaiting_ack: false,
            heartbeats_sent: 0,
            close_code: None,
            last_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent
    }

    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Start a fresh connection attempt. Sequence tracking and the session
    /// identifier belong to a single connection and are reset here.
    pub fn begin_connect(&mut self) {
        self.phase = Phase::Connecting;
        self.sequence = None;
        self.session_id = None;
        self.heartbeat_interval = None;
        self.awaiting_ack = false;
        self.close_code = None;
    }

    /// Between connections, waiting out the backoff.
    pub fn mark_reconnecting(&mut self, reason: &str) {
        self.phase = Phase::Reconnecting;
        self.session_id = None;
        self.awaiting_ack = false;
        self.last_error = Some(reason.to_string());
    }

    /// The attempt failed before reaching Ready.
    pub fn fail_attempt(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
    }

    /// Terminal transition to Disconnected.
    pub fn finish(&mut self, reason: Option<&str>) {
        self.phase = Phase::Disconnected;
        self.session_id = None;
        self.heartbeat_interval = None;
        self.awaiting_ack = false;
        if let Some(reason) = reason {
            self.last_error = Some(reason.to_string());
        }
    }

    /// Apply one event.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        match event {
            SessionEvent::Connected => {
                if self.phase == Phase::Connecting {
                    self.phase = Phase::AwaitingHello;
                }
                Vec::new()
            }
            SessionEvent::FrameReceived(text) => self.on_frame(&text),
            SessionEvent::HeartbeatDue => self.on_heartbeat_due(),
            SessionEvent::TransportClosed { code, reason } => {
                self.close_code = code;
                self.phase = Phase::Closing;
                vec![Action::Close { reason }]
            }
            SessionEvent::StopRequested => {
                self.phase = Phase::Closing;
                vec![Action::Close {
                    reason: "stop requested".to_string(),
                }]
            }
        }
    }

    fn on_frame(&mut self, text: &str) -> Vec<Action> {
        let frame = match GatewayFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Gateway: dropping malformed frame: {e}");
                self.last_error = Some(e.to_string());
                return Vec::new();
            }
        };

        if let Some(s) = frame.s {
            self.sequence = Some(self.sequence.map_or(s, |current| current.max(s)));
        }

        let kind = match frame.kind() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Gateway: {e}");
                self.last_error = Some(e.to_string());
                return Vec::new();
            }
        };

        match kind {
            FrameKind::Hello(hello) => {
                if self.phase != Phase::AwaitingHello {
                    debug!("Gateway: ignoring hello in phase {}", self.phase.as_str());
                    return Vec::new();
                }
                let interval = Duration::from_millis(hello.heartbeat_interval);
                if interval < MIN_HEARTBEAT_INTERVAL {
                    let cause = ReconnectCause::BadHeartbeatInterval(hello.heartbeat_interval);
                    warn!("Gateway: {cause}");
                    self.last_error = Some(cause.to_string());
                    return self.request_reconnect(cause);
                }
                self.heartbeat_interval = Some(interval);
                self.phase = Phase::Identifying;
                vec![
                    Action::ArmHeartbeat(interval),
                    Action::Send(GatewayFrame::identify(
                        &self.settings.bot_token,
                        self.settings.intents,
                        &self.settings.client_name,
                    )),
                ]
            }
            FrameKind::HeartbeatAck => {
                self.awaiting_ack = false;
                self.last_heartbeat = Some(Utc::now());
                Vec::new()
            }
            FrameKind::HeartbeatRequest => vec![self.send_heartbeat()],
            FrameKind::Dispatch { event, data } => self.on_dispatch(&event, data),
            FrameKind::Reconnect => self.request_reconnect(ReconnectCause::Requested),
            FrameKind::InvalidSession => self.request_reconnect(ReconnectCause::InvalidSession),
            FrameKind::Unknown(op) => {
                debug!("Gateway: ignoring opcode {op}");
                Vec::new()
            }
        }
    }

    fn on_dispatch(&mut self, name: &str, data: serde_json::Value) -> Vec<Action> {
        match name {
            event::READY => match serde_json::from_value::<Ready>(data) {
                Ok(ready) => {
                    info!(
                        "Gateway: ready as {} (session {})",
                        ready.user.username, ready.session_id
                    );
                    self.session_id = Some(ready.session_id);
                    self.username = Some(ready.user.username);
                    self.phase = Phase::Ready;
                    self.last_error = None;
                    Vec::new()
                }
                Err(e) => {
                    warn!("Gateway: bad READY payload: {e}");
                    self.last_error = Some(format!("bad READY payload: {e}"));
                    Vec::new()
                }
            },
            event::MESSAGE_CREATE => {
                if self.phase != Phase::Ready {
                    debug!("Gateway: message before ready, ignoring");
                    return Vec::new();
                }
                match serde_json::from_value::<MessageCreate>(data) {
                    Ok(message) if message.author.bot && self.settings.ignore_bots => {
                        debug!(message_id = %message.id, "Gateway: skipping bot message");
                        Vec::new()
                    }
                    Ok(message) => vec![Action::Deliver(Box::new(message))],
                    Err(e) => {
                        warn!("Gateway: bad MESSAGE_CREATE payload: {e}");
                        self.last_error = Some(format!("bad MESSAGE_CREATE payload: {e}"));
                        Vec::new()
                    }
                }
            }
            other => {
                debug!("Gateway: ignoring dispatch {other}");
                Vec::new()
            }
        }
    }

    fn on_heartbeat_due(&mut self) -> Vec<Action> {
        if !matches!(self.phase, Phase::Identifying | Phase::Ready) {
            return Vec::new();
        }
        if self.awaiting_ack {
            warn!("Gateway: heartbeat not acknowledged, reconnecting");
            return self.request_reconnect(ReconnectCause::HeartbeatMissed);
        }
        vec![self.send_heartbeat()]
    }

    fn send_heartbeat(&mut self) -> Action {
        self.awaiting_ack = true;
        self.last_heartbeat = Some(Utc::now());
        self.heartbeats_sent += 1;
        Action::Send(GatewayFrame::heartbeat(self.sequence))
    }

    fn request_reconnect(&mut self, cause: ReconnectCause) -> Vec<Action> {
        self.phase = Phase::Reconnecting;
        self.session_id = None;
        self.awaiting_ack = false;
        vec![Action::Reconnect { cause }]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gateway::protocol::opcode;
    use serde_json::json;

    pub(crate) fn settings() -> SessionSettings {
        SessionSettings {
            bot_token: "bot-token".into(),
            intents: 513,
            client_name: "chatbridge".into(),
            ignore_bots: true,
        }
    }

    fn frame(value: serde_json::Value) -> SessionEvent {
        SessionEvent::FrameReceived(value.to_string())
    }

    fn hello() -> SessionEvent {
        frame(json!({"op": 10, "d": {"heartbeat_interval": 45000}}))
    }

    fn ready(seq: u64) -> SessionEvent {
        frame(json!({
            "op": 0, "s": seq, "t": "READY",
            "d": {"session_id": "sess-1", "user": {"id": "1", "username": "bridgebot", "bot": true}}
        }))
    }

    fn message(seq: u64, id: &str, bot: bool) -> SessionEvent {
        frame(json!({
            "op": 0, "s": seq, "t": "MESSAGE_CREATE",
            "d": {
                "id": id, "channel_id": "c1", "guild_id": "g1", "content": "hi",
                "timestamp": "2024-03-01T10:00:00+00:00",
                "author": {"id": "u1", "username": "alice", "discriminator": "0", "bot": bot}
            }
        }))
    }

    fn ready_session() -> GatewaySession {
        let mut s = GatewaySession::new(settings());
        s.begin_connect();
        s.handle(SessionEvent::Connected);
        s.handle(hello());
        s.handle(ready(1));
        s
    }

    #[test]
    fn handshake_reaches_ready() {
        let mut s = GatewaySession::new(settings());
        assert_eq!(s.phase(), Phase::Disconnected);
        s.begin_connect();
        assert_eq!(s.phase(), Phase::Connecting);
        assert!(s.handle(SessionEvent::Connected).is_empty());
        assert_eq!(s.phase(), Phase::AwaitingHello);

        let actions = s.handle(hello());
        assert_eq!(s.phase(), Phase::Identifying);
        assert_eq!(actions[0], Action::ArmHeartbeat(Duration::from_millis(45000)));
        match &actions[1] {
            Action::Send(f) => {
                assert_eq!(f.op, opcode::IDENTIFY);
                assert_eq!(f.d["token"], "bot-token");
                assert_eq!(f.d["intents"], 513);
            }
            other => panic!("expected identify, got {other:?}"),
        }

        assert!(s.handle(ready(1)).is_empty());
        assert!(s.is_ready());
        assert_eq!(s.session_id(), Some("sess-1"));
        assert_eq!(s.username(), Some("bridgebot"));
        assert_eq!(s.sequence(), Some(1));
    }

    #[test]
    fn heartbeat_carries_last_sequence() {
        let mut s = ready_session();
        s.handle(message(5, "m1", false));
        let actions = s.handle(SessionEvent::HeartbeatDue);
        assert_eq!(actions, vec![Action::Send(GatewayFrame::heartbeat(Some(5)))]);
        assert!(s.last_heartbeat().is_some());
        assert_eq!(s.heartbeats_sent(), 1);
    }

    #[test]
    fn sequence_never_decreases() {
        let mut s = ready_session();
        for seq in [3, 7, 4, 9, 2] {
            s.handle(frame(json!({"op": 0, "s": seq, "t": "TYPING_START", "d": {}})));
        }
        assert_eq!(s.sequence(), Some(9));
    }

    #[test]
    fn reconnect_resets_sequence_tracking() {
        let mut s = ready_session();
        s.handle(message(12, "m1", false));
        s.mark_reconnecting("test");
        s.begin_connect();
        assert_eq!(s.sequence(), None);
        assert_eq!(s.session_id(), None);
    }

    #[test]
    fn missing_ack_triggers_reconnect() {
        let mut s = ready_session();
        assert!(matches!(
            s.handle(SessionEvent::HeartbeatDue)[0],
            Action::Send(_)
        ));
        let actions = s.handle(SessionEvent::HeartbeatDue);
        assert_eq!(
            actions,
            vec![Action::Reconnect {
                cause: ReconnectCause::HeartbeatMissed
            }]
        );
        assert_eq!(s.phase(), Phase::Reconnecting);
        assert_eq!(s.session_id(), None);
    }

    #[test]
    fn ack_keeps_session_alive() {
        let mut s = ready_session();
        for _ in 0..3 {
            assert!(matches!(
                s.handle(SessionEvent::HeartbeatDue)[0],
                Action::Send(_)
            ));
            s.handle(frame(json!({"op": 11})));
        }
        assert!(s.is_ready());
    }

    #[test]
    fn ack_advances_last_heartbeat() {
        let mut s = ready_session();
        s.handle(SessionEvent::HeartbeatDue);
        let sent_at = s.last_heartbeat().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        s.handle(frame(json!({"op": 11})));
        let acked_at = s.last_heartbeat().unwrap();
        assert!(acked_at > sent_at);

        // Acknowledged, so the next tick beats instead of reconnecting.
        assert!(matches!(
            s.handle(SessionEvent::HeartbeatDue)[0],
            Action::Send(_)
        ));
        assert!(s.last_heartbeat().unwrap() >= acked_at);
    }

    #[test]
    fn zero_heartbeat_interval_is_rejected() {
        let mut s = GatewaySession::new(settings());
        s.begin_connect();
        s.handle(SessionEvent::Connected);
        let actions = s.handle(frame(json!({"op": 10, "d": {"heartbeat_interval": 0}})));
        assert_eq!(
            actions,
            vec![Action::Reconnect {
                cause: ReconnectCause::BadHeartbeatInterval(0)
            }]
        );
        assert!(!actions.iter().any(|a| matches!(a, Action::ArmHeartbeat(_))));
        assert_eq!(s.phase(), Phase::Reconnecting);
        assert!(s.last_error().unwrap().contains("heartbeat interval"));
    }

    #[test]
    fn heartbeat_request_sends_immediately() {
        let mut s = ready_session();
        let actions = s.handle(frame(json!({"op": 1, "d": null})));
        assert_eq!(actions, vec![Action::Send(GatewayFrame::heartbeat(Some(1)))]);
    }

    #[test]
    fn server_reconnect_and_invalid_session() {
        let mut s = ready_session();
        assert_eq!(
            s.handle(frame(json!({"op": 7, "d": null}))),
            vec![Action::Reconnect {
                cause: ReconnectCause::Requested
            }]
        );

        let mut s = ready_session();
        assert_eq!(
            s.handle(frame(json!({"op": 9, "d": false}))),
            vec![Action::Reconnect {
                cause: ReconnectCause::InvalidSession
            }]
        );
    }

    #[test]
    fn message_create_is_delivered() {
        let mut s = ready_session();
        let actions = s.handle(message(2, "m1", false));
        match &actions[..] {
            [Action::Deliver(m)] => {
                assert_eq!(m.id, "m1");
                assert_eq!(m.author.username, "alice");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bot_messages_are_ignored_when_configured() {
        let mut s = ready_session();
        assert!(s.handle(message(2, "m1", true)).is_empty());

        let mut settings = settings();
        settings.ignore_bots = false;
        let mut s = GatewaySession::new(settings);
        s.begin_connect();
        s.handle(SessionEvent::Connected);
        s.handle(hello());
        s.handle(ready(1));
        assert_eq!(s.handle(message(2, "m1", true)).len(), 1);
    }

    #[test]
    fn malformed_and_unknown_frames_are_dropped() {
        let mut s = ready_session();
        assert!(s.handle(SessionEvent::FrameReceived("{oops".into())).is_empty());
        assert!(s.last_error().is_some());
        assert!(s.handle(frame(json!({"op": 99, "d": {}}))).is_empty());
        assert!(s
            .handle(frame(json!({"op": 0, "s": 2, "t": "MESSAGE_CREATE", "d": {"id": 1}})))
            .is_empty());
        assert!(s.is_ready());
        assert_eq!(s.sequence(), Some(2));
    }

    #[test]
    fn close_and_stop() {
        let mut s = ready_session();
        let actions = s.handle(SessionEvent::TransportClosed {
            code: Some(4004),
            reason: "authentication failed".into(),
        });
        assert_eq!(
            actions,
            vec![Action::Close {
                reason: "authentication failed".into()
            }]
        );
        assert_eq!(s.close_code(), Some(4004));
        s.finish(Some("authentication failed"));
        assert_eq!(s.phase(), Phase::Disconnected);
        assert_eq!(s.session_id(), None);

        let mut s = ready_session();
        assert!(matches!(
            s.handle(SessionEvent::StopRequested)[0],
            Action::Close { .. }
        ));
        assert_eq!(s.phase(), Phase::Closing);
    }

    #[test]
    fn settings_debug_redacts_token() {
        assert!(!format!("{:?}", settings()).contains("bot-token"));
    }
}
