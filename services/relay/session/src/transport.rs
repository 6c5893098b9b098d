//! Physical transport: one TCP socket session.
//!
//! A [`Transport`] is pure I/O plumbing with no application awareness
//! beyond framing: `send` is asynchronous and best-effort (silently dropped
//! once closed — queuing is the resuming queue's job), `close` is
//! idempotent and carries a reason to the peer via a `Bye` frame. A
//! transport is ephemeral: it may be replaced without destroying the
//! logical connection it served.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use relay_wire::{
    decode_envelope, encode_frame, Body, CloseReason, Envelope, FrameDecoder, WireError,
    DEFAULT_MAX_FRAME_SIZE,
};

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

enum WriterCmd {
    Frame(Bytes),
    Close(CloseReason),
}

/// One physical socket session.
///
/// Writes are handed to a dedicated writer task so `send` never blocks a
/// caller; the read side is driven by the owning task through
/// [`TransportReader`].
pub struct Transport {
    id: String,
    peer: SocketAddr,
    writer_tx: mpsc::UnboundedSender<WriterCmd>,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    closed_notify: Notify,
    binding: Mutex<Option<String>>,
}

impl Transport {
    /// Wrap an established socket, returning the shared transport handle
    /// and the reader driving its inbound side
    pub fn new(stream: TcpStream) -> tokio::io::Result<(Arc<Self>, TransportReader)> {
        let peer = stream.peer_addr()?;
        let (read_half, mut write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCmd>();

        let transport = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            peer,
            writer_tx,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            closed_notify: Notify::new(),
            binding: Mutex::new(None),
        });

        tokio::spawn(async move {
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCmd::Frame(frame) => {
                        if let Err(e) = write_half.write_all(&frame).await {
                            debug!("transport write to {} failed: {}", peer, e);
                            break;
                        }
                    }
                    WriterCmd::Close(reason) => {
                        let bye = Envelope::new(Body::Bye {
                            code: reason.code(),
                            reason: reason.text().to_string(),
                        });
                        if let Ok(frame) = encode_frame(&bye, DEFAULT_MAX_FRAME_SIZE) {
                            let _ = write_half.write_all(&frame).await;
                        }
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
        });

        let reader = TransportReader {
            transport: transport.clone(),
            read_half,
            decoder: FrameDecoder::new(),
            buffer: BytesMut::with_capacity(16 * 1024),
        };

        Ok((transport, reader))
    }

    /// Unique id of this transport session
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer socket address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send an envelope, best-effort. Dropped silently when the transport
    /// is no longer connected.
    pub fn send(&self, envelope: &Envelope) {
        if self.is_closed() {
            trace!("dropping {} frame for closed transport {}", envelope.body.kind(), self.id);
            return;
        }
        match encode_frame(envelope, DEFAULT_MAX_FRAME_SIZE) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => warn!("failed to encode {} frame: {}", envelope.body.kind(), e),
        }
    }

    /// Send pre-encoded frame bytes, best-effort
    pub fn send_frame(&self, frame: Bytes) {
        if self.is_closed() {
            return;
        }
        let _ = self.writer_tx.send(WriterCmd::Frame(frame));
    }

    /// Request close of the underlying socket. Idempotent; the first
    /// reason wins and a `Bye` frame is sent to the peer best-effort.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.lock().unwrap() = Some(reason);
        let _ = self.writer_tx.send(WriterCmd::Close(reason));
        self.closed_notify.notify_one();
        debug!("transport {} to {} closing: {}", self.id, self.peer, reason);
    }

    /// Whether close has been requested or observed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The reason this transport closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }

    /// Record the connection this transport currently serves
    pub fn bind(&self, connection_id: &str) {
        *self.binding.lock().unwrap() = Some(connection_id.to_string());
    }

    /// Clear the connection binding
    pub fn unbind(&self) {
        *self.binding.lock().unwrap() = None;
    }

    /// Id of the connection this transport is bound to, if any
    pub fn bound_connection(&self) -> Option<String> {
        self.binding.lock().unwrap().clone()
    }

    fn record_remote_close(&self, reason: CloseReason) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.close_reason.lock().unwrap() = Some(reason);
            self.closed_notify.notify_one();
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Inbound side of a transport, owned by the task driving the socket
pub struct TransportReader {
    transport: Arc<Transport>,
    read_half: OwnedReadHalf,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl TransportReader {
    /// Handle of the transport this reader feeds
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Read the next envelope.
    ///
    /// Returns `Err(reason)` once the transport is done: peer `Bye`, local
    /// close, EOF, socket error, or a protocol violation (non-text or
    /// undecodable frame closes with `BadData`).
    pub async fn next(&mut self) -> Result<Envelope, CloseReason> {
        loop {
            match self.decoder.decode(&mut self.buffer) {
                Ok(Some(payload)) => match decode_envelope(&payload) {
                    Ok(envelope) => {
                        if let Body::Bye { code, ref reason } = envelope.body {
                            let close = CloseReason::from_code(code);
                            debug!(
                                "transport {} received bye from {}: {} ({})",
                                self.transport.id, self.transport.peer, reason, code
                            );
                            self.transport.record_remote_close(close);
                            return Err(close);
                        }
                        return Ok(envelope);
                    }
                    Err(WireError::NotText) => {
                        warn!("non-text frame from {}", self.transport.peer);
                        self.transport.close(CloseReason::BadData);
                        return Err(CloseReason::BadData);
                    }
                    Err(e) => {
                        warn!("undecodable frame from {}: {}", self.transport.peer, e);
                        self.transport.close(CloseReason::BadData);
                        return Err(CloseReason::BadData);
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("framing error from {}: {}", self.transport.peer, e);
                    self.transport.close(CloseReason::BadData);
                    return Err(CloseReason::BadData);
                }
            }

            if self.transport.is_closed() {
                return Err(self.transport.close_reason().unwrap_or(CloseReason::Normal));
            }

            tokio::select! {
                read = self.read_half.read_buf(&mut self.buffer) => {
                    match read {
                        Ok(0) => {
                            self.transport.record_remote_close(CloseReason::Normal);
                            return Err(self.transport.close_reason().unwrap_or(CloseReason::Normal));
                        }
                        Ok(n) => {
                            trace!("read {} bytes from {}", n, self.transport.peer);
                        }
                        Err(e) => {
                            debug!("transport read from {} failed: {}", self.transport.peer, e);
                            self.transport.record_remote_close(CloseReason::Normal);
                            return Err(CloseReason::Normal);
                        }
                    }
                }
                _ = self.transport.closed_notify.notified() => {
                    return Err(self.transport.close_reason().unwrap_or(CloseReason::Normal));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        let client = connect_tcp(bound).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = loopback_pair().await;
        let (ta, _ra) = Transport::new(a).unwrap();
        let (_tb, mut rb) = Transport::new(b).unwrap();

        ta.send(&Envelope::new(Body::Ping { corr_id: 11 }));

        let envelope = timeout(Duration::from_secs(2), rb.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.body, Body::Ping { corr_id: 11 });
    }

    #[tokio::test]
    async fn test_close_carries_reason() {
        let (a, b) = loopback_pair().await;
        let (ta, _ra) = Transport::new(a).unwrap();
        let (tb, mut rb) = Transport::new(b).unwrap();

        ta.close(CloseReason::DuplicateConnect);

        let err = timeout(Duration::from_secs(2), rb.next())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, CloseReason::DuplicateConnect);
        assert_eq!(tb.close_reason(), Some(CloseReason::DuplicateConnect));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = loopback_pair().await;
        let (ta, _ra) = Transport::new(a).unwrap();

        ta.close(CloseReason::WrongMessage);
        ta.close(CloseReason::Normal);
        assert_eq!(ta.close_reason(), Some(CloseReason::WrongMessage));
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (a, _b) = loopback_pair().await;
        let (ta, _ra) = Transport::new(a).unwrap();
        ta.close(CloseReason::Normal);
        // Must not panic or error
        ta.send(&Envelope::new(Body::Ping { corr_id: 1 }));
    }

    #[tokio::test]
    async fn test_non_text_frame_closes_bad_data() {
        let (a, b) = loopback_pair().await;
        let (_tb, mut rb) = Transport::new(b).unwrap();

        // Hand-craft a framed payload that is not valid UTF-8
        let mut raw = a;
        raw.write_all(&4u32.to_be_bytes()).await.unwrap();
        raw.write_all(&[0xFF, 0xFE, 0x00, 0x01]).await.unwrap();

        let err = timeout(Duration::from_secs(2), rb.next())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, CloseReason::BadData);
    }

    #[tokio::test]
    async fn test_binding_bookkeeping() {
        let (a, _b) = loopback_pair().await;
        let (ta, _ra) = Transport::new(a).unwrap();

        assert!(ta.bound_connection().is_none());
        ta.bind("conn-1");
        assert_eq!(ta.bound_connection().as_deref(), Some("conn-1"));
        ta.unbind();
        assert!(ta.bound_connection().is_none());
    }
}
