//! Read-only external view of the gateway session.
//!
//! The session driver is the only writer of the connection fields; readers
//! take copies through [`StatusSurface::snapshot`]. A bounded log of recent
//! connection events backs the status endpoint.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::warn;

use crate::gateway::session::{GatewaySession, Phase};

/// Maximum number of recent connection events to retain.
const MAX_CONNECTION_EVENTS: usize = 50;

/// Point-in-time copy of the session state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub phase: Phase,
    pub session_id: Option<String>,
    pub username: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_interval_ms: Option<u64>,
    pub sequence: Option<u64>,
    pub last_error: Option<String>,
    pub close_code: Option<u16>,
    pub reconnects: u64,
    pub heartbeats: u64,
    pub updated_at: Option<DateTime<Utc>>,
    /// Last session error copied into `last_error`, so an unchanged session
    /// error does not overwrite a newer pipeline error.
    #[serde(skip)]
    session_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Connecting,
    Ready,
    HeartbeatMissed,
    Reconnecting,
    Disconnected,
    Error,
}

impl ConnectionEventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::HeartbeatMissed => "heartbeat_missed",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub at: DateTime<Utc>,
    pub kind: ConnectionEventKind,
    pub detail: String,
}

/// Shared status holder.
#[derive(Debug)]
pub struct StatusSurface {
    tx: watch::Sender<StatusSnapshot>,
    events: Mutex<VecDeque<ConnectionEvent>>,
}

impl Default for StatusSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSurface {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self {
            tx,
            events: Mutex::new(VecDeque::with_capacity(MAX_CONNECTION_EVENTS)),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    /// Copy the session's fields into the snapshot.
    ///
    /// `last_error` is cleared when the session enters Ready and replaced when
    /// the session reports a new error; otherwise it is left alone.
    pub fn publish(&self, session: &GatewaySession) {
        self.tx.send_modify(|s| {
            if session.is_ready() && s.phase != Phase::Ready {
                s.last_error = None;
            }
            let session_error = session.last_error().map(str::to_string);
            if session_error != s.session_error {
                if let Some(err) = &session_error {
                    s.last_error = Some(err.clone());
                }
                s.session_error = session_error;
            }
            s.connected = session.is_ready();
            s.phase = session.phase();
            s.session_id = session.session_id().map(str::to_string);
            if let Some(name) = session.username() {
                s.username = Some(name.to_string());
            }
            s.last_heartbeat = session.last_heartbeat();
            s.heartbeat_interval_ms = session
                .heartbeat_interval()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            s.sequence = session.sequence();
            s.close_code = session.close_code();
            s.heartbeats = session.heartbeats_sent();
            s.updated_at = Some(Utc::now());
        });
    }

    /// Force the disconnected view without a session (abort or drop paths).
    pub fn mark_disconnected(&self, reason: Option<&str>) {
        self.tx.send_modify(|s| {
            s.connected = false;
            s.phase = Phase::Disconnected;
            s.session_id = None;
            if let Some(reason) = reason {
                s.last_error = Some(reason.to_string());
            }
            s.updated_at = Some(Utc::now());
        });
    }

    /// Record an error outside the session (e.g. storage failure in the pipeline).
    pub fn set_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_modify(|s| {
            s.last_error = Some(error);
            s.updated_at = Some(Utc::now());
        });
    }

    pub fn note_reconnect(&self) {
        self.tx.send_modify(|s| s.reconnects += 1);
    }

    /// Push a connection event, evicting oldest if at capacity.
    pub async fn push_event(&self, kind: ConnectionEventKind, detail: impl Into<String>) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_CONNECTION_EVENTS {
            events.pop_front();
        }
        events.push_back(ConnectionEvent {
            at: Utc::now(),
            kind,
            detail: detail.into(),
        });
    }

    /// Newest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<ConnectionEvent> {
        self.events
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Pid file present while a gateway session task runs. Removed on drop, so
/// every exit path of the owning task releases it.
#[derive(Debug)]
pub struct LivenessMarker {
    path: PathBuf,
}

impl LivenessMarker {
    pub fn acquire(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LivenessMarker {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove liveness marker {}: {e}", self.path.display());
            }
        }
    }
}

/// Pid recorded in a marker file, if present and parseable.
pub fn read_marker(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether `pid` names a live process. Without procfs the marker is trusted.
pub fn pid_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.is_dir() {
        proc_root.join(pid.to_string()).exists()
    } else {
        true
    }
}

/// "Ns ago" / "Nm ago" / "Nh ago" relative to now.
pub fn format_ago(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}
