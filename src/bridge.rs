//! Control surface for the gateway session: start, stop, status.
//!
//! At most one session task runs per process. Each start spawns the gateway
//! driver and a fresh delivery worker connected by a bounded queue; stopping
//! cancels the driver, which drops the queue sender and lets the worker drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::GatewayDriver;
use crate::pipeline::{Pipeline, DELIVERY_QUEUE};
use crate::status::{StatusSnapshot, StatusSurface};

/// How long `stop` waits for the driver to close before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Status snapshot plus control-surface state.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub session: StatusSnapshot,
}

struct RunningSession {
    generation: u64,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    /// Cancelled by the task itself when the driver returns.
    finished: CancellationToken,
    task: JoinHandle<Result<(), GatewayError>>,
    worker: JoinHandle<()>,
}

pub struct Bridge {
    config: Arc<Config>,
    status: Arc<StatusSurface>,
    pipeline: Arc<Pipeline>,
    running: Mutex<Option<RunningSession>>,
    generation: AtomicU64,
}

impl Bridge {
    pub fn new(config: Arc<Config>, status: Arc<StatusSurface>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            config,
            status,
            pipeline,
            running: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Spawn the session task unless one is already running.
    pub async fn start(&self) -> Result<StartOutcome, GatewayError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.finished.is_cancelled()) {
            return Ok(StartOutcome::AlreadyRunning);
        }
        if let Some(previous) = running.take() {
            if let Err(e) = reap(previous).await {
                warn!("previous gateway session ended with error: {e}");
            }
        }

        if self.config.gateway.bot_token.trim().is_empty() {
            return Err(GatewayError::NotConfigured(
                "gateway.bot_token is empty (set CHATBRIDGE_BOT_TOKEN)".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE);
        let driver = GatewayDriver::new(
            self.config.gateway.clone(),
            self.status.clone(),
            tx,
            Some(self.config.marker_path()),
        )
        .map_err(|e| GatewayError::Transport(format!("http client: {e}")))?;
        let worker = self.pipeline.clone().spawn_worker(rx);

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            let finished = finished.clone();
            let status = self.status.clone();
            tokio::spawn(async move {
                let result = driver.run(cancel).await;
                if let Err(e) = &result {
                    error!("Gateway: session failed: {e}");
                    status.set_error(e.to_string());
                }
                finished.cancel();
                result
            })
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *running = Some(RunningSession {
            generation,
            started_at: Utc::now(),
            cancel,
            finished,
            task,
            worker,
        });
        info!("Gateway session started");
        Ok(StartOutcome::Started)
    }

    /// Stop the session task. A no-op when nothing is running.
    ///
    /// The lock is held until the task has been reaped, so a concurrent
    /// `start` waits for the old driver (and its liveness marker) to be gone.
    pub async fn stop(&self) -> StopOutcome {
        let mut running = self.running.lock().await;
        let Some(session) = running.take() else {
            return StopOutcome::NotRunning;
        };
        let was_running = !session.finished.is_cancelled();
        session.cancel.cancel();
        if let Err(e) = reap(session).await {
            warn!("gateway session ended with error: {e}");
        }
        self.status.mark_disconnected(None);
        drop(running);
        if was_running {
            info!("Gateway session stopped");
            StopOutcome::Stopped
        } else {
            StopOutcome::NotRunning
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.finished.is_cancelled())
    }

    pub async fn status(&self) -> BridgeStatus {
        let running = self.running.lock().await;
        let active = running.as_ref().filter(|r| !r.finished.is_cancelled());
        BridgeStatus {
            running: active.is_some(),
            started_at: active.map(|r| r.started_at),
            session: self.status.snapshot(),
        }
    }

    /// Wait for the current session task to end on its own and return its result.
    /// Returns `None` when nothing is running or the session was stopped meanwhile.
    pub async fn wait_session(&self) -> Option<Result<(), GatewayError>> {
        let (generation, finished) = {
            let running = self.running.lock().await;
            let r = running.as_ref()?;
            (r.generation, r.finished.clone())
        };
        finished.cancelled().await;

        let mut running = self.running.lock().await;
        if running.as_ref().map(|r| r.generation) != Some(generation) {
            return None;
        }
        let session = running.take()?;
        Some(reap(session).await)
    }
}

/// Join the driver (aborting it after [`STOP_TIMEOUT`]) and then the worker.
async fn reap(session: RunningSession) -> Result<(), GatewayError> {
    let RunningSession {
        mut task, worker, ..
    } = session;
    let result = match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(GatewayError::Transport(format!("session task failed: {e}"))),
        Err(_) => {
            warn!("Gateway: session did not stop in time, aborting");
            task.abort();
            Ok(())
        }
    };
    if tokio::time::timeout(STOP_TIMEOUT, worker).await.is_err() {
        warn!("delivery worker did not drain in time");
    }
    result
}
