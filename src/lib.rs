#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! chatbridge library — forwards chat-gateway messages to task-chat channels.
//!
//! Building blocks:
//! - `gateway` — wire protocol, session state machine, and the async driver
//! - `pipeline` — router → store → forwarder, delivery worker, retry driver
//! - `store` — deduplicated, bounded message store (memory and JSON file)
//! - `forwarder` — downstream HTTP delivery and message formatting
//! - `token` — downstream bearer token lifecycle
//! - `router` — static source → destination channel mapping
//! - `bridge` — start/stop/status control surface
//! - `status` — status snapshot, connection events, liveness marker
//! - `auth` — API key authentication middleware
//! - `config` — configuration loading
//! - `routes` — REST API route handlers

pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod pipeline;
pub mod router;
pub mod routes;
pub mod state;
pub mod status;
pub mod store;
pub mod token;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use bridge::Bridge;
pub use config::Config;
pub use pipeline::Pipeline;
pub use state::AppState;
pub use store::{FileStore, MemoryStore, MessageStore};
