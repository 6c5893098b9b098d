//! Close reason codes for transport shutdown.

use std::fmt;

/// Why a transport was (or is being) closed.
///
/// Carried in the `Bye` frame's `code` field so the peer learns the reason
/// before the socket goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly shutdown requested by either side
    Normal,
    /// Evicted because the same identity connected elsewhere
    DuplicateConnect,
    /// Message received out of handshake order, or otherwise invalid
    WrongMessage,
    /// Non-text or undecodable frame received
    BadData,
    /// Handshake abandoned before completion
    ConnectCancelled,
}

impl CloseReason {
    /// Numeric code carried on the wire
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::DuplicateConnect => 4001,
            CloseReason::WrongMessage => 4002,
            CloseReason::BadData => 4003,
            CloseReason::ConnectCancelled => 4004,
        }
    }

    /// Map a wire code back to a reason; unknown codes read as `Normal`
    pub fn from_code(code: u16) -> Self {
        match code {
            4001 => CloseReason::DuplicateConnect,
            4002 => CloseReason::WrongMessage,
            4003 => CloseReason::BadData,
            4004 => CloseReason::ConnectCancelled,
            _ => CloseReason::Normal,
        }
    }

    /// Canonical reason text for the `Bye` frame
    pub fn text(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal close",
            CloseReason::DuplicateConnect => "duplicate connect",
            CloseReason::WrongMessage => "wrong message",
            CloseReason::BadData => "bad data",
            CloseReason::ConnectCancelled => "connect cancelled",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text(), self.code())
    }
}
