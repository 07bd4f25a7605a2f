//! Router → store → forwarder pipeline, the delivery worker, and the retry driver.
//!
//! Every message the pipeline accepts ends up Pending, Sent, or Failed with a
//! reason. The delivery lock serializes record writes between the worker and
//! the retry driver so a record is never forwarded by both at once.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::UnmappedPolicy;
use crate::error::{FailureKind, ForwardError, StoreError};
use crate::forwarder::Forwarder;
use crate::gateway::protocol::MessageCreate;
use crate::router::ChannelRouter;
use crate::status::StatusSurface;
use crate::store::{ForwardingState, MessageStore, StoredMessage};

/// Capacity of the session → worker queue.
pub const DELIVERY_QUEUE: usize = 256;

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Source channel has no mapping and the policy drops it.
    Unmapped,
    /// Source channel has no mapping; recorded but not forwarded.
    StoredUnmapped,
    /// Already Sent on an earlier observation.
    AlreadySent,
    Delivered {
        destination_message_id: Option<String>,
    },
    /// No downstream token; the record stays Pending.
    AwaitingAuth,
    Failed {
        kind: FailureKind,
        error: String,
    },
    /// Evicted by retention before the retry reached it.
    Evicted,
    StorageError {
        error: String,
    },
}

/// One entry of a retry run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryResult {
    pub message_id: String,
    #[serde(flatten)]
    pub outcome: ProcessOutcome,
}

/// Shared pipeline; cheap to clone behind an `Arc`.
pub struct Pipeline {
    router: Arc<ChannelRouter>,
    store: Arc<dyn MessageStore>,
    forwarder: Forwarder,
    unmapped_policy: UnmappedPolicy,
    status: Arc<StatusSurface>,
    delivery_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        router: Arc<ChannelRouter>,
        store: Arc<dyn MessageStore>,
        forwarder: Forwarder,
        unmapped_policy: UnmappedPolicy,
        status: Arc<StatusSurface>,
    ) -> Self {
        Self {
            router,
            store,
            forwarder,
            unmapped_policy,
            status,
            delivery_lock: Mutex::new(()),
        }
    }

    /// Run one inbound event through the pipeline.
    pub async fn process(&self, event: &MessageCreate) -> ProcessOutcome {
        let destination = self.router.resolve(&event.channel_id);
        if destination.is_none() && self.unmapped_policy == UnmappedPolicy::Drop {
            debug!(channel_id = %event.channel_id, "message from unwatched channel dropped");
            return ProcessOutcome::Unmapped;
        }

        let _guard = self.delivery_lock.lock().await;
        let recorded = match self.store.record_inbound(event).await {
            Ok(recorded) => recorded,
            Err(e) => return self.storage_failed(&event.id, &e),
        };

        let Some(destination) = destination else {
            return ProcessOutcome::StoredUnmapped;
        };
        if !recorded.is_new && recorded.message.state == ForwardingState::Sent {
            debug!(message_id = %event.id, "already forwarded, skipping");
            return ProcessOutcome::AlreadySent;
        }

        self.forward(&recorded.message, destination).await
    }

    /// Re-run Failed and Pending records through router and forwarder, oldest first.
    pub async fn retry_failed(&self) -> Vec<RetryResult> {
        let mut candidates = self.store.list_failed().await;
        candidates.extend(self.store.list_pending().await);
        info!(count = candidates.len(), "retrying undelivered messages");

        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let _guard = self.delivery_lock.lock().await;
            let outcome = match self.store.get(&candidate.id).await {
                None => ProcessOutcome::Evicted,
                Some(current) if current.state == ForwardingState::Sent => {
                    ProcessOutcome::AlreadySent
                }
                Some(current) => {
                    let event = current.to_event();
                    match self.router.resolve(&event.channel_id) {
                        Some(destination) => self.forward(&current, destination).await,
                        None => ProcessOutcome::Unmapped,
                    }
                }
            };
            results.push(RetryResult {
                message_id: candidate.id.clone(),
                outcome,
            });
        }
        results
    }

    /// Consume events from the session in order until the sender is dropped.
    pub fn spawn_worker(self: Arc<Self>, mut rx: mpsc::Receiver<MessageCreate>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match self.process(&event).await {
                    ProcessOutcome::Delivered { .. } => {
                        info!(message_id = %event.id, channel_id = %event.channel_id, "message forwarded");
                    }
                    ProcessOutcome::Failed { kind, error } => {
                        warn!(message_id = %event.id, kind = kind.as_str(), "forwarding failed: {error}");
                    }
                    ProcessOutcome::AwaitingAuth => {
                        warn!(message_id = %event.id, "no downstream token, message left pending");
                    }
                    other => debug!(message_id = %event.id, ?other, "message processed"),
                }
            }
            debug!("delivery worker stopped");
        })
    }

    async fn forward(&self, message: &StoredMessage, destination: &str) -> ProcessOutcome {
        match self.forwarder.deliver(message, destination).await {
            Ok(destination_message_id) => {
                // Delivered even when the Sent write fails.
                if let Err(e) = self
                    .store
                    .mark_sent(&message.id, destination, destination_message_id.clone())
                    .await
                {
                    self.storage_failed(&message.id, &e);
                }
                ProcessOutcome::Delivered {
                    destination_message_id,
                }
            }
            Err(ForwardError::Unauthenticated) => ProcessOutcome::AwaitingAuth,
            Err(e) => {
                let kind = e.kind();
                let description = e.to_string();
                match self.store.mark_failed(&message.id, kind, &description).await {
                    Ok(_) => ProcessOutcome::Failed {
                        kind,
                        error: description,
                    },
                    Err(e) => self.storage_failed(&message.id, &e),
                }
            }
        }
    }

    fn storage_failed(&self, message_id: &str, e: &StoreError) -> ProcessOutcome {
        error!(message_id, "message store error: {e}");
        self.status.set_error(format!("storage: {e}"));
        ProcessOutcome::StorageError {
            error: e.to_string(),
        }
    }
}
