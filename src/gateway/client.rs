//! Gateway driver — owns the socket, the heartbeat timer, and the stop signal.
//!
//! Spawned by the bridge when a session is started. Each connection attempt
//! discovers the gateway URL, connects, and feeds every frame and timer tick
//! through [`GatewaySession`], executing the actions it returns. Failed
//! attempts and post-Ready disconnects are retried with exponential backoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::protocol::MessageCreate;
use super::session::{Action, GatewaySession, ReconnectCause, SessionEvent, SessionSettings};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::status::{ConnectionEventKind, LivenessMarker, StatusSurface};

impl From<&GatewayConfig> for SessionSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            bot_token: config.bot_token.clone(),
            intents: config.intents,
            client_name: config.client_name.clone(),
            ignore_bots: config.ignore_bots,
        }
    }
}

/// How one connection ended without an error.
#[derive(Debug)]
enum Disconnect {
    /// Stop was requested.
    Stopped,
    /// Lost after reaching Ready.
    Lost { reason: String },
}

/// Marks the status surface disconnected however the driver exits, including abort.
struct StatusGuard(Arc<StatusSurface>);

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.0.mark_disconnected(None);
    }
}

/// Runs one gateway session until stopped or until start fails for good.
pub struct GatewayDriver {
    config: GatewayConfig,
    http: reqwest::Client,
    status: Arc<StatusSurface>,
    deliveries: mpsc::Sender<MessageCreate>,
    marker_path: Option<PathBuf>,
}

impl GatewayDriver {
    pub fn new(
        config: GatewayConfig,
        status: Arc<StatusSurface>,
        deliveries: mpsc::Sender<MessageCreate>,
        marker_path: Option<PathBuf>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.handshake_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            config,
            http,
            status,
            deliveries,
            marker_path,
        })
    }

    /// Main loop: connect, run, reconnect with backoff.
    ///
    /// Returns `Ok` after a requested stop (or a post-Ready disconnect with
    /// `auto_reconnect` off) and [`GatewayError::HandshakeFailed`] once
    /// `max_connect_attempts` consecutive attempts have failed.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let _marker = self.marker_path.as_deref().and_then(|path| {
            LivenessMarker::acquire(path)
                .map_err(|e| warn!("Gateway: cannot write liveness marker {}: {e}", path.display()))
                .ok()
        });
        let _guard = StatusGuard(self.status.clone());

        let mut session = GatewaySession::new(SessionSettings::from(&self.config));
        let base_delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let max_delay = Duration::from_secs(self.config.reconnect_max_delay_secs).max(base_delay);
        let max_attempts = self.config.max_connect_attempts.max(1);
        let mut delay = base_delay;
        let mut failures: u32 = 0;

        loop {
            session.begin_connect();
            self.status.publish(&session);
            self.status
                .push_event(ConnectionEventKind::Connecting, &self.config.discovery_url)
                .await;

            let reason = match self.connect_and_run(&mut session, &cancel).await {
                Ok(Disconnect::Stopped) => {
                    info!("Gateway: session stopped");
                    self.finish(&mut session, None, "stopped").await;
                    return Ok(());
                }
                Ok(Disconnect::Lost { reason }) => {
                    failures = 0;
                    delay = base_delay;
                    if !self.config.auto_reconnect {
                        info!("Gateway: disconnected ({reason}), auto-reconnect disabled");
                        self.finish(&mut session, Some(reason.as_str()), &reason).await;
                        return Ok(());
                    }
                    reason
                }
                Err(e) => {
                    failures += 1;
                    let msg = e.to_string();
                    warn!("Gateway: connection attempt {failures}/{max_attempts} failed: {msg}");
                    session.fail_attempt(&msg);
                    self.status
                        .push_event(ConnectionEventKind::Error, msg.clone())
                        .await;
                    if failures >= max_attempts {
                        self.finish(&mut session, Some(msg.as_str()), "giving up").await;
                        return Err(GatewayError::HandshakeFailed {
                            attempts: failures,
                            last: msg,
                        });
                    }
                    msg
                }
            };

            session.mark_reconnecting(&reason);
            self.status.note_reconnect();
            self.status.publish(&session);
            self.status
                .push_event(
                    ConnectionEventKind::Reconnecting,
                    format!("{reason}, retrying in {}s", delay.as_secs()),
                )
                .await;
            info!("Gateway: reconnecting in {}s", delay.as_secs());

            tokio::select! {
                () = cancel.cancelled() => {
                    self.finish(&mut session, None, "stopped during backoff").await;
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(max_delay);
        }
    }

    async fn finish(&self, session: &mut GatewaySession, reason: Option<&str>, detail: &str) {
        session.finish(reason);
        self.status.publish(session);
        self.status
            .push_event(ConnectionEventKind::Disconnected, detail)
            .await;
    }

    /// A single connection attempt: discover, connect, handle frames until disconnect.
    async fn connect_and_run(
        &self,
        session: &mut GatewaySession,
        cancel: &CancellationToken,
    ) -> Result<Disconnect, GatewayError> {
        let timeout_secs = self.config.handshake_timeout_secs.max(1);
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);

        let connecting = async {
            let url = discover(&self.http, &self.config.discovery_url).await?;
            let ws_url = gateway_ws_url(&url, self.config.api_version);
            info!("Gateway: connecting to {ws_url}");
            let (ws, _response) = tokio_tungstenite::connect_async(ws_url.as_str())
                .await
                .map_err(|e| GatewayError::Transport(e.to_string()))?;
            Ok::<_, GatewayError>(ws)
        };
        let ws = tokio::select! {
            () = cancel.cancelled() => return Ok(Disconnect::Stopped),
            result = tokio::time::timeout_at(deadline, connecting) => match result {
                Ok(ws) => ws?,
                Err(_) => return Err(GatewayError::HandshakeTimeout(timeout_secs)),
            },
        };

        let (mut sink, mut stream) = ws.split();
        session.handle(SessionEvent::Connected);
        self.status.publish(session);

        let handshake = tokio::time::sleep_until(deadline);
        tokio::pin!(handshake);
        let mut heartbeat: Option<Interval> = None;
        let mut reached_ready = false;
        let mut stopping = false;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    SessionEvent::StopRequested
                }
                () = &mut handshake, if !reached_ready => {
                    let _ = sink.close().await;
                    return Err(GatewayError::HandshakeTimeout(timeout_secs));
                }
                () = next_tick(&mut heartbeat) => SessionEvent::HeartbeatDue,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => SessionEvent::FrameReceived(text.as_str().to_owned()),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                        });
                        let reason = if reason.is_empty() {
                            "closed by gateway".to_string()
                        } else {
                            reason
                        };
                        SessionEvent::TransportClosed { code, reason }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return ended(reached_ready, format!("read failed: {e}")),
                    None => SessionEvent::TransportClosed {
                        code: None,
                        reason: "stream ended".to_string(),
                    },
                },
            };

            let actions = session.handle(event);
            if session.is_ready() && !reached_ready {
                reached_ready = true;
                self.status
                    .push_event(
                        ConnectionEventKind::Ready,
                        session.username().unwrap_or_default().to_string(),
                    )
                    .await;
            }
            self.status.publish(session);

            for action in actions {
                match action {
                    Action::Send(frame) => {
                        let text = frame.encode()?;
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            return ended(reached_ready, format!("send failed: {e}"));
                        }
                    }
                    Action::ArmHeartbeat(period) => {
                        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        heartbeat = Some(interval);
                    }
                    Action::Deliver(message) => {
                        if self.deliveries.send(*message).await.is_err() {
                            warn!("Gateway: delivery worker gone, message dropped");
                        }
                    }
                    Action::Reconnect { cause } => {
                        let reason = cause.to_string();
                        if cause == ReconnectCause::HeartbeatMissed {
                            self.status
                                .push_event(ConnectionEventKind::HeartbeatMissed, reason.clone())
                                .await;
                        }
                        let _ = sink.close().await;
                        return ended(reached_ready, reason);
                    }
                    Action::Close { reason } => {
                        let _ = sink.close().await;
                        if stopping {
                            return Ok(Disconnect::Stopped);
                        }
                        return ended(reached_ready, reason);
                    }
                }
            }
        }
    }
}

/// After Ready a lost connection is a normal reconnect; before it, a failed attempt.
fn ended(reached_ready: bool, reason: String) -> Result<Disconnect, GatewayError> {
    if reached_ready {
        Ok(Disconnect::Lost { reason })
    } else {
        Err(GatewayError::Transport(reason))
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// `GET` the discovery endpoint and return its `url`.
pub async fn discover(http: &reqwest::Client, discovery_url: &str) -> Result<String, GatewayError> {
    #[derive(Deserialize)]
    struct GatewayUrl {
        url: String,
    }

    let resp = http
        .get(discovery_url)
        .send()
        .await
        .map_err(|e| GatewayError::Discovery(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(GatewayError::Discovery(format!("HTTP {}", status.as_u16())));
    }
    let body: GatewayUrl = resp
        .json()
        .await
        .map_err(|e| GatewayError::Discovery(format!("bad discovery response: {e}")))?;
    if body.url.is_empty() {
        return Err(GatewayError::Discovery("empty gateway url".to_string()));
    }
    Ok(body.url)
}

/// Append the version and encoding query to a discovered gateway URL.
pub fn gateway_ws_url(base: &str, version: u32) -> String {
    let base = base.trim_end_matches('/');
    format!("{base}/?v={version}&encoding=json")
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::response::Response;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    /// How the fake gateway behaves after the upgrade.
    #[derive(Clone, Copy, PartialEq)]
    enum Script {
        Normal,
        /// Never sends Hello.
        Silent,
        /// Sends Hello with a zero heartbeat interval.
        ZeroInterval,
    }

    #[derive(Clone)]
    struct FakeGateway {
        connections: Arc<AtomicUsize>,
        script: Script,
    }

    async fn spawn_fake_gateway(script: Script) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let state = FakeGateway {
            connections: connections.clone(),
            script,
        };
        let app = Router::new()
            .route(
                "/gateway",
                get(move || async move { Json(json!({ "url": format!("ws://{addr}/ws") })) }),
            )
            .route("/ws/", get(upgrade))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, connections)
    }

    async fn upgrade(ws: WebSocketUpgrade, State(state): State<FakeGateway>) -> Response {
        let n = state.connections.fetch_add(1, Ordering::SeqCst);
        ws.on_upgrade(move |socket| fake_session(socket, n, state.script))
    }

    async fn send(socket: &mut WebSocket, value: Value) {
        socket
            .send(WsMessage::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    /// Connection 0 is told to reconnect after READY; later ones deliver messages.
    async fn fake_session(mut socket: WebSocket, n: usize, script: Script) {
        match script {
            Script::Silent => {
                while let Some(Ok(_)) = socket.recv().await {}
                return;
            }
            Script::ZeroInterval => {
                send(&mut socket, json!({"op": 10, "d": {"heartbeat_interval": 0}})).await;
                while let Some(Ok(_)) = socket.recv().await {}
                return;
            }
            Script::Normal => {}
        }
        send(&mut socket, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;

        while let Some(Ok(msg)) = socket.recv().await {
            let WsMessage::Text(text) = msg else { continue };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            match frame["op"].as_u64() {
                Some(2) => {
                    assert_eq!(frame["d"]["token"], "bot-token");
                    assert_eq!(frame["d"]["intents"], 513);
                    send(&mut socket, json!({
                        "op": 0, "s": 1, "t": "READY",
                        "d": {"session_id": format!("sess-{n}"), "user": {"id": "1", "username": "bridgebot", "bot": true}}
                    }))
                    .await;
                    if n == 0 {
                        send(&mut socket, json!({"op": 7, "d": null})).await;
                        continue;
                    }
                    send(&mut socket, json!({
                        "op": 0, "s": 2, "t": "MESSAGE_CREATE",
                        "d": {
                            "id": "m-1", "channel_id": "c1", "guild_id": "g1", "content": "hello",
                            "timestamp": "2024-03-01T10:00:00+00:00",
                            "author": {"id": "u1", "username": "alice", "discriminator": "0"}
                        }
                    }))
                    .await;
                    send(&mut socket, json!({
                        "op": 0, "s": 3, "t": "MESSAGE_CREATE",
                        "d": {
                            "id": "m-2", "channel_id": "c1", "content": "beep",
                            "author": {"id": "u2", "username": "otherbot", "bot": true}
                        }
                    }))
                    .await;
                }
                Some(1) => send(&mut socket, json!({"op": 11})).await,
                _ => {}
            }
        }
    }

    fn config(discovery_url: String) -> GatewayConfig {
        GatewayConfig {
            bot_token: "bot-token".into(),
            discovery_url,
            reconnect_delay_secs: 0,
            handshake_timeout_secs: 5,
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn ws_url_gets_version_query() {
        assert_eq!(
            gateway_ws_url("wss://gateway.discord.gg", 10),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_ws_url("wss://gateway.discord.gg/", 9),
            "wss://gateway.discord.gg/?v=9&encoding=json"
        );
    }

    #[tokio::test]
    async fn discovery_reads_url() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/gateway")
            .with_status(200)
            .with_body(r#"{"url":"wss://gateway.example"}"#)
            .create_async()
            .await;
        let url = discover(&reqwest::Client::new(), &format!("{}/api/gateway", server.url()))
            .await
            .unwrap();
        assert_eq!(url, "wss://gateway.example");
    }

    #[tokio::test]
    async fn session_reconnects_and_delivers() {
        let (addr, connections) = spawn_fake_gateway(Script::Normal).await;
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("gateway.pid");
        let status = Arc::new(StatusSurface::new());
        let (tx, mut rx) = mpsc::channel(8);

        let driver = GatewayDriver::new(
            config(format!("http://{addr}/gateway")),
            status.clone(),
            tx,
            Some(marker.clone()),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(driver.run(cancel.clone()));

        let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, "m-1");
        assert_eq!(message.author.username, "alice");
        assert!(marker.exists());

        let snap = status.snapshot();
        assert!(snap.connected);
        assert_eq!(snap.session_id.as_deref(), Some("sess-1"));
        assert_eq!(snap.reconnects, 1);
        assert!(snap.sequence >= Some(2));
        assert_eq!(connections.load(Ordering::SeqCst), 2);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!marker.exists());
        assert!(!status.snapshot().connected);
        assert!(rx.recv().await.is_none(), "bot message must not be delivered");
    }

    #[tokio::test]
    async fn repeated_discovery_failure_is_fatal() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/gateway")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let status = Arc::new(StatusSurface::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut cfg = config(format!("{}/api/gateway", server.url()));
        cfg.max_connect_attempts = 3;

        let err = GatewayDriver::new(cfg, status.clone(), tx, None)
            .unwrap()
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::HandshakeFailed { attempts: 3, .. }));
        mock.assert_async().await;

        let snap = status.snapshot();
        assert!(!snap.connected);
        assert_eq!(snap.reconnects, 2);
        assert!(snap.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn silent_gateway_times_out_handshake() {
        let (addr, _) = spawn_fake_gateway(Script::Silent).await;
        let status = Arc::new(StatusSurface::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut cfg = config(format!("http://{addr}/gateway"));
        cfg.handshake_timeout_secs = 1;
        cfg.max_connect_attempts = 1;

        let err = GatewayDriver::new(cfg, status, tx, None)
            .unwrap()
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            GatewayError::HandshakeFailed { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(last.contains("handshake"), "{last}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_fails_the_attempt() {
        let (addr, connections) = spawn_fake_gateway(Script::ZeroInterval).await;
        let status = Arc::new(StatusSurface::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut cfg = config(format!("http://{addr}/gateway"));
        cfg.max_connect_attempts = 2;

        let task = tokio::spawn(
            GatewayDriver::new(cfg, status.clone(), tx, None)
                .unwrap()
                .run(CancellationToken::new()),
        );
        let joined = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap();
        let err = joined.expect("driver task must not panic").unwrap_err();
        match err {
            GatewayError::HandshakeFailed { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.contains("heartbeat interval"), "{last}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(connections.load(Ordering::SeqCst), 2);
        assert!(!status.snapshot().connected);
    }

    #[tokio::test]
    async fn stop_during_backoff_returns_ok() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/gateway")
            .with_status(500)
            .create_async()
            .await;
        let status = Arc::new(StatusSurface::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut cfg = config(format!("{}/api/gateway", server.url()));
        cfg.reconnect_delay_secs = 30;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            GatewayDriver::new(cfg, status, tx, None)
                .unwrap()
                .run(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
