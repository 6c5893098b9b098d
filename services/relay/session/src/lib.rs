//! TCP transport, resuming send queue, logical connections, and request
//! correlation for searelay.
//!
//! This crate turns an unreliable, reconnecting byte transport into a
//! logical, ordered, resumable connection:
//!
//! - **Transport**: one physical socket; pure I/O plumbing with best-effort
//!   `send` and an idempotent, reason-carrying `close`
//! - **ResumingQueue**: per-connection outbound buffer assigning strictly
//!   increasing message ids, trimmed by cumulative acks, replayed onto a
//!   fresh transport after reconnect
//! - **Connection**: the identity-stable endpoint that survives transport
//!   churn; dedupes inbound sequence ids and piggybacks acks on every send
//! - **RequestCorrelator**: pending-request map matching asynchronous
//!   responses to callers, with timeout and drain-on-close semantics
//! - **Handshake / Keepalive**: WELCOME/HELLO/CONNECTED sequencing and
//!   PING/PONG with RTT measurement

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod correlator;
pub mod handshake;
pub mod keepalive;
pub mod resume_queue;
pub mod transport;

// Re-export main types
pub use connection::{Connection, ConnectionState, SendError};
pub use correlator::{PendingRequest, RequestCorrelator, RequestError};
pub use handshake::{client_handshake, Handshake, HandshakeError, HelloParams};
pub use keepalive::{now_corr_id, ping_body, pong_body, KeepaliveState};
pub use resume_queue::{Outstanding, ResumingQueue};
pub use transport::{connect_tcp, listen_tcp, Transport, TransportReader};
