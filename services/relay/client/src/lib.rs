//! Vessel-side relay client.
//!
//! A [`RelayClient`] holds the logical connection to the relay server and
//! layers recovery on top of it: transport loss triggers a reconnect loop
//! with exponential backoff, re-handshaking with the previous connection
//! id as the reconnect token and replaying unacked traffic. Pending
//! requests survive the swap; only an explicit [`RelayClient::close`]
//! fails them.
//!
//! On top of the connection the client offers:
//!
//! - **Services**: `register_service` (one registration per name) and
//!   `invoke` with exactly four terminal outcomes
//! - **Broadcast**: explicit `subscribe(channel, listener)` registration;
//!   deliveries run on their own tasks, listener panics are logged and
//!   never propagate
//! - **Relay**: fire-and-forget client-to-client messages

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod client;
pub mod services;

// Re-export main types
pub use broadcast::{BroadcastEvent, BroadcastListener, BroadcastSubscriptions};
pub use client::{ClientConfig, ClientError, RelayClient};
pub use services::{ServiceHandler, ServiceRegistry};
