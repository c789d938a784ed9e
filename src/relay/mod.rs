//! Live snapshot delivery to the dashboard relay

pub mod client;
pub mod protocol;

pub use client::{ConnectionState, RelayClient, RelayClientConfig, RelayEmitter, RelayHandle};
pub use protocol::RelayMessage;
