//! Gateway session: wire protocol, state machine, and the async driver.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::GatewayDriver;
pub use protocol::MessageCreate;
pub use session::{GatewaySession, Phase};
