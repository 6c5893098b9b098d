//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame size limit exceeded
    #[error("frame size limit exceeded: {0}")]
    Size(usize),

    /// Frame payload is not valid UTF-8 text
    #[error("frame is not text")]
    NotText,

    /// Envelope JSON failed to parse or serialize
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),
}
