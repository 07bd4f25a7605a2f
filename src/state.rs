//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::error::StoreError;
use crate::forwarder::Forwarder;
use crate::pipeline::Pipeline;
use crate::router::ChannelRouter;
use crate::status::StatusSurface;
use crate::store::{FileStore, MemoryStore, MessageStore};
use crate::token::TokenStore;

/// Wiring failed at startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Shared application state for the chatbridge server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Gateway session control surface.
    pub bridge: Arc<Bridge>,
    pub store: Arc<dyn MessageStore>,
    pub tokens: Arc<TokenStore>,
    pub status: Arc<StatusSurface>,
}

impl AppState {
    /// Open the stores under `server.data_dir` and wire the pipeline and bridge.
    pub async fn from_config(config: Config) -> Result<Self, StartupError> {
        let config = Arc::new(config);

        let store: Arc<dyn MessageStore> = if config.store.persist {
            Arc::new(FileStore::open(config.messages_path(), config.store.capacity).await?)
        } else {
            Arc::new(MemoryStore::new(config.store.capacity))
        };
        let tokens = Arc::new(TokenStore::open(config.token_path()).await);
        info!(
            backend = store.name(),
            capacity = config.store.capacity,
            routes = config.channels.len(),
            authenticated = tokens.has_valid_token().await,
            "message pipeline ready"
        );

        let status = Arc::new(StatusSurface::new());
        let forwarder = Forwarder::new(&config.forward, tokens.clone())?;
        let router = Arc::new(ChannelRouter::new(config.channels.clone()));
        let pipeline = Arc::new(Pipeline::new(
            router,
            store.clone(),
            forwarder,
            config.store.unmapped_policy,
            status.clone(),
        ));
        let bridge = Arc::new(Bridge::new(config.clone(), status.clone(), pipeline));

        Ok(Self {
            config,
            start_time: Instant::now(),
            bridge,
            store,
            tokens,
            status,
        })
    }
}
