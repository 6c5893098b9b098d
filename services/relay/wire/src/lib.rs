//! Wire envelope, JSON codec, text-frame framing, and close reasons for searelay.
//!
//! This crate provides the message-level wire protocol for the relay network:
//! the JSON envelope carried by every frame, incremental length-prefixed
//! framing, and the close-reason codes used when a transport is shut down.
//!
//! ## Features
//!
//! - **JSON Envelope**: a tagged sum type over the finite message kinds,
//!   dispatched with a single `match`
//! - **Correlation Fields**: per-connection sequence numbers, cumulative
//!   acks, and request/response ids on the envelope itself
//! - **Text Framing**: `u32` length prefix followed by UTF-8 JSON; non-text
//!   frames are a protocol violation
//! - **Zero-Copy I/O**: uses `Bytes`/`BytesMut` for minimal allocations
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | envelope_json        | UTF-8 JSON object          |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod close;
pub mod codec;
pub mod envelope;
pub mod error;

// Re-export main types
pub use close::CloseReason;
pub use codec::{
    decode_envelope, encode_envelope, encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE,
};
pub use envelope::{Body, Envelope, PROTOCOL_VERSION};
pub use error::WireError;
