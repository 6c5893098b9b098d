//! Client-side handshake: WELCOME → HELLO → CONNECTED.
//!
//! The sequence is strict. Any other message arriving before the handshake
//! completes is a protocol violation and closes the transport with
//! `WrongMessage`; running out of time closes it with `ConnectCancelled`.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use relay_wire::{Body, CloseReason, Envelope, PROTOCOL_VERSION};

use crate::transport::TransportReader;

/// Parameters the client presents in its HELLO
#[derive(Debug, Clone)]
pub struct HelloParams {
    /// Stable client identity, e.g. `mmsi://265547240`
    pub client_id: String,
    /// Human-readable client banner
    pub banner: String,
    /// Previous connection id when resuming, `None` for a fresh connect
    pub reconnect_token: Option<String>,
    /// Latitude at handshake time
    pub lat: f64,
    /// Longitude at handshake time
    pub lon: f64,
    /// Highest server sequence number already received, for server-side
    /// replay after a reconnect
    pub last_received: u64,
}

/// Outcome of a successful handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Connection id assigned (or re-confirmed) by the server
    pub connection_id: String,
    /// Replay baseline: highest of our sequence numbers the server has
    pub last_received_msg_id: u64,
    /// Server identity from the WELCOME
    pub server_id: String,
}

/// Handshake failures
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// No WELCOME or CONNECTED arrived within the deadline
    #[error("handshake timed out")]
    Timeout,

    /// The transport closed mid-handshake
    #[error("transport closed during handshake: {0}")]
    Closed(CloseReason),

    /// An unexpected message kind arrived mid-handshake
    #[error("unexpected {0} during handshake")]
    WrongMessage(&'static str),

    /// The server speaks an incompatible protocol version
    #[error("protocol version mismatch: server speaks {0}")]
    VersionMismatch(u8),
}

/// Run the client side of the handshake on a freshly opened transport.
///
/// On success the transport is ready for ordinary traffic; on failure it
/// has been closed with the appropriate reason.
pub async fn client_handshake(
    reader: &mut TransportReader,
    params: HelloParams,
    deadline: Duration,
) -> Result<Handshake, HandshakeError> {
    let transport = reader.transport().clone();

    let welcome = expect_frame(reader, deadline).await?;
    let server_id = match welcome.body {
        Body::Welcome {
            protocol_version,
            server_id,
            ..
        } => {
            if protocol_version != PROTOCOL_VERSION {
                transport.close(CloseReason::WrongMessage);
                return Err(HandshakeError::VersionMismatch(protocol_version));
            }
            server_id
        }
        other => {
            transport.close(CloseReason::WrongMessage);
            return Err(HandshakeError::WrongMessage(other.kind()));
        }
    };

    let mut hello = Envelope::new(Body::Hello {
        client_id: params.client_id.clone(),
        banner: params.banner,
        reconnect_token: params.reconnect_token,
        protocol_version: PROTOCOL_VERSION,
        lat: params.lat,
        lon: params.lon,
    });
    hello.last_received = Some(params.last_received);
    transport.send(&hello);

    let connected = expect_frame(reader, deadline).await?;
    match connected.body {
        Body::Connected {
            connection_id,
            last_received_msg_id,
        } => {
            debug!(
                "handshake complete for {}: connection {} baseline {}",
                params.client_id, connection_id, last_received_msg_id
            );
            Ok(Handshake {
                connection_id,
                last_received_msg_id,
                server_id,
            })
        }
        other => {
            transport.close(CloseReason::WrongMessage);
            Err(HandshakeError::WrongMessage(other.kind()))
        }
    }
}

async fn expect_frame(
    reader: &mut TransportReader,
    deadline: Duration,
) -> Result<Envelope, HandshakeError> {
    match tokio::time::timeout(deadline, reader.next()).await {
        Ok(Ok(envelope)) => Ok(envelope),
        Ok(Err(reason)) => Err(HandshakeError::Closed(reason)),
        Err(_) => {
            reader.transport().close(CloseReason::ConnectCancelled);
            Err(HandshakeError::Timeout)
        }
    }
}
