//! Target registry, broadcast fan-out, service directory, and position
//! tracking for searelay.
//!
//! This crate is the server side of the relay: it maps stable vessel
//! identities onto their (possibly churning) transports, serializes the
//! handshake takeover race per identity, fans broadcasts out to live
//! connections, and answers proximity-based service lookups.
//!
//! All components are wired by explicit constructor injection — one
//! registry per server instance, no process-wide statics — so multiple
//! independent servers can coexist in one process (and in one test).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod position;
pub mod registry;
pub mod server;
pub mod services;
pub mod target;

// Re-export main types
pub use broadcast::BroadcastRouter;
pub use position::{haversine_m, PositionFix, PositionTracker};
pub use registry::{HelloOutcome, TargetRegistry};
pub use server::{RelayServer, ServerConfig};
pub use services::ServiceDirectory;
pub use target::Target;
