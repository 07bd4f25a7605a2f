//! Deduplicated, bounded record of inbound messages and their forwarding state.
//!
//! The external message id is the idempotency key: observing the same id again
//! updates the mutable fields of the existing record instead of inserting a
//! second one. Only the `capacity` most recently created records are retained.
//!
//! Records are immutable `Arc` values swapped whole under a short write lock,
//! so readers never see a half-updated record and never wait on disk I/O.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::error::{FailureKind, StoreError};
use crate::gateway::protocol::{Attachment, GatewayUser, MessageCreate};

/// Forwarding state of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardingState {
    Pending,
    Sent,
    Failed,
}

impl ForwardingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// One observed message plus its delivery outcome.
///
/// Keeps every field of the source event so a retry rebuilds it faithfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_global_name: Option<String>,
    #[serde(default)]
    pub author_discriminator: Option<String>,
    #[serde(default)]
    pub author_bot: bool,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub source_timestamp: DateTime<Utc>,
    pub state: ForwardingState,
    #[serde(default)]
    pub destination_channel: Option<String>,
    #[serde(default)]
    pub destination_message_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Fresh Pending record for an inbound event.
    pub fn from_event(event: &MessageCreate) -> Self {
        let now = Utc::now();
        Self {
            id: event.id.clone(),
            channel_id: event.channel_id.clone(),
            guild_id: event.guild_id.clone(),
            author_id: event.author.id.clone(),
            author_name: event.author.username.clone(),
            author_global_name: event.author.global_name.clone(),
            author_discriminator: event.author.discriminator.clone(),
            author_bot: event.author.bot,
            content: event.content.clone(),
            attachments: event.attachments.clone(),
            source_timestamp: event.timestamp,
            state: ForwardingState::Pending,
            destination_channel: None,
            destination_message_id: None,
            last_error: None,
            failure_kind: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild the event this record was created from.
    pub fn to_event(&self) -> MessageCreate {
        MessageCreate {
            id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            guild_id: self.guild_id.clone(),
            author: GatewayUser {
                id: self.author_id.clone(),
                username: self.author_name.clone(),
                discriminator: self.author_discriminator.clone(),
                global_name: self.author_global_name.clone(),
                bot: self.author_bot,
            },
            content: self.content.clone(),
            timestamp: self.source_timestamp,
            attachments: self.attachments.clone(),
        }
    }

    /// Copy with the non-identity fields refreshed from a re-observed event.
    fn refreshed(&self, event: &MessageCreate) -> Self {
        let mut next = self.clone();
        next.author_name.clone_from(&event.author.username);
        next.author_global_name.clone_from(&event.author.global_name);
        next.author_discriminator
            .clone_from(&event.author.discriminator);
        next.content.clone_from(&event.content);
        next.attachments.clone_from(&event.attachments);
        next.updated_at = Utc::now();
        next
    }
}

/// Result of [`MessageStore::record_inbound`].
#[derive(Debug, Clone)]
pub struct Recorded {
    /// False when the id was already present and the record was updated in place.
    pub is_new: bool,
    pub message: Arc<StoredMessage>,
}

/// Aggregate counts over the retained records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
    pub capacity: usize,
    /// Percentage of retained records that are Sent, two decimals.
    pub success_rate: f64,
}

/// Message store backend.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Insert a Pending record, or refresh the existing one with the same id.
    async fn record_inbound(&self, event: &MessageCreate) -> Result<Recorded, StoreError>;

    /// Transition to Sent and clear any error.
    async fn mark_sent(
        &self,
        id: &str,
        destination_channel: &str,
        destination_message_id: Option<String>,
    ) -> Result<Arc<StoredMessage>, StoreError>;

    /// Transition to Failed, overwriting the previous error.
    async fn mark_failed(
        &self,
        id: &str,
        kind: FailureKind,
        description: &str,
    ) -> Result<Arc<StoredMessage>, StoreError>;

    async fn get(&self, id: &str) -> Option<Arc<StoredMessage>>;

    /// Most recently created first.
    async fn list_recent(&self, limit: usize) -> Vec<Arc<StoredMessage>>;

    /// Failed records, oldest first.
    async fn list_failed(&self) -> Vec<Arc<StoredMessage>>;

    /// Pending records, oldest first.
    async fn list_pending(&self) -> Vec<Arc<StoredMessage>>;

    /// Records from one source channel, most recently created first.
    async fn list_by_channel(&self, channel_id: &str, limit: usize) -> Vec<Arc<StoredMessage>>;

    async fn stats(&self) -> StoreStats;

    /// Backend name, for logging.
    fn name(&self) -> &'static str;
}

// ── In-memory ring ───────────────────────────────────────────

#[derive(Debug, Default)]
struct Ring {
    /// Ids in creation order, oldest at the front.
    order: VecDeque<String>,
    records: HashMap<String, Arc<StoredMessage>>,
}

impl Ring {
    fn snapshot(&self) -> Vec<Arc<StoredMessage>> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    fn filtered(&self, state: ForwardingState) -> Vec<Arc<StoredMessage>> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|m| m.state == state)
            .cloned()
            .collect()
    }
}

/// Bounded in-memory store. Contents are lost on restart.
#[derive(Debug)]
pub struct MemoryStore {
    ring: RwLock<Ring>,
    capacity: usize,
}

impl MemoryStore {
    /// Capacity below 1 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring::default()),
            capacity: capacity.max(1),
        }
    }

    /// Seed from records ordered oldest first, applying retention.
    fn with_records(capacity: usize, records: Vec<StoredMessage>) -> Self {
        let capacity = capacity.max(1);
        let mut ring = Ring::default();
        for record in records {
            if ring.records.contains_key(&record.id) {
                continue;
            }
            ring.order.push_back(record.id.clone());
            ring.records.insert(record.id.clone(), Arc::new(record));
        }
        while ring.order.len() > capacity {
            if let Some(old) = ring.order.pop_front() {
                ring.records.remove(&old);
            }
        }
        Self {
            ring: RwLock::new(ring),
            capacity,
        }
    }

    async fn snapshot(&self) -> Vec<Arc<StoredMessage>> {
        self.ring.read().await.snapshot()
    }

    async fn update<F>(&self, id: &str, f: F) -> Result<Arc<StoredMessage>, StoreError>
    where
        F: FnOnce(&StoredMessage) -> StoredMessage + Send,
    {
        let mut ring = self.ring.write().await;
        let current = ring
            .records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let next = Arc::new(f(current));
        ring.records.insert(id.to_string(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn record_inbound(&self, event: &MessageCreate) -> Result<Recorded, StoreError> {
        let mut ring = self.ring.write().await;
        if let Some(existing) = ring.records.get(&event.id) {
            let next = Arc::new(existing.refreshed(event));
            ring.records.insert(event.id.clone(), next.clone());
            debug!(message_id = %event.id, state = next.state.as_str(), "message re-observed");
            return Ok(Recorded {
                is_new: false,
                message: next,
            });
        }

        let record = Arc::new(StoredMessage::from_event(event));
        ring.order.push_back(event.id.clone());
        ring.records.insert(event.id.clone(), record.clone());
        while ring.order.len() > self.capacity {
            if let Some(old) = ring.order.pop_front() {
                ring.records.remove(&old);
                debug!(message_id = %old, "evicted by retention");
            }
        }
        Ok(Recorded {
            is_new: true,
            message: record,
        })
    }

    async fn mark_sent(
        &self,
        id: &str,
        destination_channel: &str,
        destination_message_id: Option<String>,
    ) -> Result<Arc<StoredMessage>, StoreError> {
        self.update(id, |m| StoredMessage {
            state: ForwardingState::Sent,
            destination_channel: Some(destination_channel.to_string()),
            destination_message_id,
            last_error: None,
            failure_kind: None,
            attempts: m.attempts + 1,
            updated_at: Utc::now(),
            ..m.clone()
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: &str,
        kind: FailureKind,
        description: &str,
    ) -> Result<Arc<StoredMessage>, StoreError> {
        self.update(id, |m| StoredMessage {
            state: ForwardingState::Failed,
            last_error: Some(description.to_string()),
            failure_kind: Some(kind),
            attempts: m.attempts + 1,
            updated_at: Utc::now(),
            ..m.clone()
        })
        .await
    }

    async fn get(&self, id: &str) -> Option<Arc<StoredMessage>> {
        self.ring.read().await.records.get(id).cloned()
    }

    async fn list_recent(&self, limit: usize) -> Vec<Arc<StoredMessage>> {
        let ring = self.ring.read().await;
        ring.order
            .iter()
            .rev()
            .filter_map(|id| ring.records.get(id).cloned())
            .take(limit)
            .collect()
    }

    async fn list_failed(&self) -> Vec<Arc<StoredMessage>> {
        self.ring.read().await.filtered(ForwardingState::Failed)
    }

    async fn list_pending(&self) -> Vec<Arc<StoredMessage>> {
        self.ring.read().await.filtered(ForwardingState::Pending)
    }

    async fn list_by_channel(&self, channel_id: &str, limit: usize) -> Vec<Arc<StoredMessage>> {
        let ring = self.ring.read().await;
        ring.order
            .iter()
            .rev()
            .filter_map(|id| ring.records.get(id))
            .filter(|m| m.channel_id == channel_id)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn stats(&self) -> StoreStats {
        let ring = self.ring.read().await;
        let mut stats = StoreStats {
            total: ring.records.len(),
            pending: 0,
            sent: 0,
            failed: 0,
            capacity: self.capacity,
            success_rate: 0.0,
        };
        for m in ring.records.values() {
            match m.state {
                ForwardingState::Pending => stats.pending += 1,
                ForwardingState::Sent => stats.sent += 1,
                ForwardingState::Failed => stats.failed += 1,
            }
        }
        if stats.total > 0 {
            #[allow(clippy::cast_precision_loss)]
            let rate = stats.sent as f64 / stats.total as f64 * 100.0;
            stats.success_rate = (rate * 100.0).round() / 100.0;
        }
        stats
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ── JSON file backend ────────────────────────────────────────

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    /// Oldest first.
    messages: Vec<StoredMessage>,
}

/// [`MemoryStore`] that writes a full snapshot to disk after every change.
///
/// Writes go to `<path>.tmp` and are renamed into place, so the file on disk is
/// always a complete snapshot. Persists are serialized; each one captures the
/// state after its own change, so the last write always carries the newest state.
#[derive(Debug)]
pub struct FileStore {
    inner: MemoryStore,
    path: PathBuf,
    persist_lock: Mutex<()>,
}

impl FileStore {
    /// Load `path` if it exists. A corrupt file is logged and replaced by an
    /// empty store on the next write.
    pub async fn open(path: PathBuf, capacity: usize) -> Result<Self, StoreError> {
        let records = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<Snapshot>(&data) {
                Ok(snapshot) => {
                    info!(
                        path = %path.display(),
                        count = snapshot.messages.len(),
                        "message store loaded"
                    );
                    snapshot.messages
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "message store file is corrupt, starting empty");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self {
            inner: MemoryStore::with_records(capacity, records),
            path,
            persist_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let messages: Vec<StoredMessage> = self
            .inner
            .snapshot()
            .await
            .iter()
            .map(|m| (**m).clone())
            .collect();
        let data = serde_json::to_vec_pretty(&Snapshot {
            version: SNAPSHOT_VERSION,
            messages,
        })?;

        let io_err = |source| StoreError::Io {
            path: self.path.display().to_string(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn record_inbound(&self, event: &MessageCreate) -> Result<Recorded, StoreError> {
        let recorded = self.inner.record_inbound(event).await?;
        self.persist().await?;
        Ok(recorded)
    }

    async fn mark_sent(
        &self,
        id: &str,
        destination_channel: &str,
        destination_message_id: Option<String>,
    ) -> Result<Arc<StoredMessage>, StoreError> {
        let updated = self
            .inner
            .mark_sent(id, destination_channel, destination_message_id)
            .await?;
        self.persist().await?;
        Ok(updated)
    }

    async fn mark_failed(
        &self,
        id: &str,
        kind: FailureKind,
        description: &str,
    ) -> Result<Arc<StoredMessage>, StoreError> {
        let updated = self.inner.mark_failed(id, kind, description).await?;
        self.persist().await?;
        Ok(updated)
    }

    async fn get(&self, id: &str) -> Option<Arc<StoredMessage>> {
        self.inner.get(id).await
    }

    async fn list_recent(&self, limit: usize) -> Vec<Arc<StoredMessage>> {
        self.inner.list_recent(limit).await
    }

    async fn list_failed(&self) -> Vec<Arc<StoredMessage>> {
        self.inner.list_failed().await
    }

    async fn list_pending(&self) -> Vec<Arc<StoredMessage>> {
        self.inner.list_pending().await
    }

    async fn list_by_channel(&self, channel_id: &str, limit: usize) -> Vec<Arc<StoredMessage>> {
        self.inner.list_by_channel(channel_id, limit).await
    }

    async fn stats(&self) -> StoreStats {
        self.inner.stats().await
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
