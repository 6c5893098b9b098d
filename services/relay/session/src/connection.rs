//! The logical, identity-stable connection.
//!
//! A [`Connection`] outlives the transports that serve it: rebinding to a
//! fresh transport after a reconnect keeps the resuming queue, the
//! dedupe high-water mark, and every pending request intact. Only a
//! connection-level close is terminal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace};

use relay_wire::{Body, CloseReason, Envelope, WireError};

use crate::correlator::{PendingRequest, RequestCorrelator, RequestError};
use crate::resume_queue::ResumingQueue;
use crate::transport::Transport;

/// Connection lifecycle states.
///
/// A connection with no bound transport is still `Connected`: temporarily
/// disconnected, not yet given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, handshake not yet started
    Initialized,
    /// Handshake in progress
    Connecting,
    /// Handshake completed; transport may come and go
    Connected,
    /// Terminal: no further sends, all pending requests failed
    Closed,
}

/// Errors from the send paths
#[derive(Error, Debug)]
pub enum SendError {
    /// The connection is closed; nothing is accepted any more
    #[error("connection closed")]
    Closed,

    /// The envelope failed to encode
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Logical endpoint for one identity, resumable across transports
pub struct Connection {
    identity: String,
    connection_id: Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
    queue: ResumingQueue,
    correlator: Arc<RequestCorrelator>,
    last_received: AtomicU64,
    transport: Mutex<Option<Arc<Transport>>>,
}

impl Connection {
    /// Create a connection for `identity`, not yet handshaken
    pub fn new(identity: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            connection_id: Mutex::new(None),
            state: Mutex::new(ConnectionState::Initialized),
            queue: ResumingQueue::new(),
            correlator: Arc::new(RequestCorrelator::new()),
            last_received: AtomicU64::new(0),
            transport: Mutex::new(None),
        })
    }

    /// Stable identity this connection belongs to
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Connection id assigned during the handshake, if any yet
    pub fn id(&self) -> Option<String> {
        self.connection_id.lock().unwrap().clone()
    }

    /// Record the handshake-assigned connection id
    pub fn assign_id(&self, connection_id: impl Into<String>) {
        *self.connection_id.lock().unwrap() = Some(connection_id.into());
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Whether the connection has been terminally closed
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Mark the handshake as started
    pub fn begin_connecting(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnectionState::Initialized {
            *state = ConnectionState::Connecting;
        }
    }

    /// Bind a transport, atomically detaching any previous one first.
    ///
    /// At most one transport is ever bound; the caller is responsible for
    /// closing an evicted transport with the appropriate reason. Returns
    /// `false` when the connection is already closed (the transport is
    /// left untouched for the caller to dispose of).
    pub fn set_transport(&self, transport: Arc<Transport>) -> bool {
        // Lock order is state → transport everywhere, matching `close`
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Connected;
        }

        let mut guard = self.transport.lock().unwrap();
        if self.is_closed() {
            // A concurrent close won; do not bind into a closed connection
            return false;
        }

        if let Some(old) = guard.take() {
            old.unbind();
            debug!(
                "connection {} detached transport {} for {}",
                self.identity,
                old.id(),
                transport.id()
            );
        }
        if let Some(id) = self.id() {
            transport.bind(&id);
        }
        *guard = Some(transport);
        true
    }

    /// Detach `transport_id` if it is still the bound one. The connection
    /// stays logically connected; pending requests are untouched.
    pub fn detach_transport(&self, transport_id: &str) -> bool {
        let mut guard = self.transport.lock().unwrap();
        match guard.as_ref() {
            Some(current) if current.id() == transport_id => {
                let old = guard.take().unwrap();
                old.unbind();
                debug!(
                    "connection {} lost transport {}, staying connected",
                    self.identity, transport_id
                );
                true
            }
            _ => false,
        }
    }

    /// Currently bound transport, if any
    pub fn bound_transport(&self) -> Option<Arc<Transport>> {
        self.transport.lock().unwrap().clone()
    }

    /// Send a sequenced message: stamp the cumulative ack, assign the next
    /// sequence id, queue for replay, and hand to the bound transport
    pub fn send(&self, body: Body) -> Result<u64, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let mut envelope = Envelope::new(body);
        envelope.last_received = Some(self.last_received.load(Ordering::SeqCst));
        let transport = self.bound_transport();
        Ok(self.queue.write(envelope, transport.as_deref())?)
    }

    /// Send a request-type message, returning the pending handle its
    /// response will resolve
    pub fn send_request(&self, body: Body) -> Result<PendingRequest, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let mut envelope = Envelope::new(body);
        envelope.last_received = Some(self.last_received.load(Ordering::SeqCst));
        let transport = self.bound_transport();
        let correlator = self.correlator.clone();
        let (_, pending) =
            self.queue
                .write_request(envelope, transport.as_deref(), move |request_id| {
                    let rx = correlator.register(request_id);
                    PendingRequest::new(request_id, correlator.clone(), rx)
                })?;
        Ok(pending)
    }

    /// Send a response to a request: sequenced like [`send`](Self::send),
    /// with `msg_ack` echoing the request id so the peer's correlator can
    /// resolve it
    pub fn send_response(&self, body: Body, request_id: u64) -> Result<u64, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let mut envelope = Envelope::new(body);
        envelope.last_received = Some(self.last_received.load(Ordering::SeqCst));
        envelope.msg_ack = Some(request_id);
        let transport = self.bound_transport();
        Ok(self.queue.write(envelope, transport.as_deref())?)
    }

    /// Send a control message: ack-stamped but never sequenced or queued.
    /// Silently dropped when no transport is bound.
    pub fn send_control(&self, body: Body) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let mut envelope = Envelope::new(body);
        envelope.last_received = Some(self.last_received.load(Ordering::SeqCst));
        if let Some(transport) = self.bound_transport() {
            transport.send(&envelope);
        }
        Ok(())
    }

    /// Inbound bookkeeping for a decoded envelope.
    ///
    /// Updates the dedupe high-water mark, trims the queue from the
    /// piggybacked ack, and routes responses to the correlator. Returns
    /// the envelope when it still needs kind-specific dispatch, `None`
    /// when it was a duplicate or consumed by the correlator.
    pub fn on_envelope(&self, envelope: Envelope) -> Option<Envelope> {
        if let Some(acked) = envelope.last_received {
            self.queue.ack_up_to(acked);
        }

        if let Some(msg_id) = envelope.msg_id {
            let previous = self.last_received.fetch_max(msg_id, Ordering::SeqCst);
            if msg_id <= previous {
                trace!(
                    "connection {} dropping duplicate msg_id {} (seen {})",
                    self.identity,
                    msg_id,
                    previous
                );
                return None;
            }
        }

        if let Some(request_id) = envelope.msg_ack {
            self.correlator.on_response(request_id, envelope);
            return None;
        }

        Some(envelope)
    }

    /// Replay unacked messages onto the bound transport after trimming up
    /// to the remote's acknowledged baseline
    pub fn resume(&self, acked: u64) {
        if let Some(transport) = self.bound_transport() {
            self.queue.resume(&transport, acked);
        }
    }

    /// Terminal close: fail every pending request, refuse further sends,
    /// and close the bound transport with `reason`. Idempotent.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closed;
        }

        self.correlator.fail_all(RequestError::ConnectionClosed);

        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            transport.unbind();
            transport.close(reason);
        }
        debug!("connection {} closed: {}", self.identity, reason);
    }

    /// Highest peer sequence number seen so far
    pub fn last_received(&self) -> u64 {
        self.last_received.load(Ordering::SeqCst)
    }

    /// The correlator resolving this connection's requests
    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// Number of sent-but-unacked sequenced messages
    pub fn unacked_len(&self) -> usize {
        self.queue.unacked_len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("id", &self.id())
            .field("state", &self.state())
            .field("unacked", &self.unacked_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{connect_tcp, listen_tcp, TransportReader};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn transport_pair() -> (Arc<Transport>, TransportReader, Arc<Transport>, TransportReader)
    {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        let client = connect_tcp(bound).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (ta, ra) = Transport::new(client).unwrap();
        let (tb, rb) = Transport::new(server).unwrap();
        (ta, ra, tb, rb)
    }

    fn position(lat: f64) -> Body {
        Body::PositionReport { lat, lon: 0.0 }
    }

    #[tokio::test]
    async fn test_send_stamps_sequence_and_ack() {
        let (ta, _ra, _tb, mut rb) = transport_pair().await;
        let conn = Connection::new("mmsi://1");
        conn.assign_id("c-1");
        assert!(conn.set_transport(ta));

        conn.send(position(1.0)).unwrap();
        conn.send(position(2.0)).unwrap();

        let first = timeout(Duration::from_secs(2), rb.next())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(2), rb.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.msg_id, Some(1));
        assert_eq!(second.msg_id, Some(2));
        assert_eq!(first.last_received, Some(0));
    }

    #[tokio::test]
    async fn test_duplicate_inbound_is_dropped() {
        let conn = Connection::new("mmsi://1");

        let mut env = Envelope::new(position(1.0));
        env.msg_id = Some(5);
        assert!(conn.on_envelope(env.clone()).is_some());
        // Same id again: duplicate
        assert!(conn.on_envelope(env.clone()).is_none());
        // Older id: duplicate
        env.msg_id = Some(3);
        assert!(conn.on_envelope(env).is_none());
        assert_eq!(conn.last_received(), 5);
    }

    #[tokio::test]
    async fn test_inbound_ack_trims_queue() {
        let conn = Connection::new("mmsi://1");
        conn.send(position(1.0)).unwrap();
        conn.send(position(2.0)).unwrap();
        conn.send(position(3.0)).unwrap();
        assert_eq!(conn.unacked_len(), 3);

        let mut env = Envelope::new(Body::Ping { corr_id: 1 });
        env.last_received = Some(2);
        assert!(conn.on_envelope(env).is_some());
        assert_eq!(conn.unacked_len(), 1);
    }

    #[tokio::test]
    async fn test_response_routed_to_correlator() {
        let conn = Connection::new("mmsi://1");
        let pending = conn
            .send_request(Body::RegisterService {
                name: "Ping".to_string(),
            })
            .unwrap();
        assert_eq!(pending.id(), 1);

        let mut response = Envelope::new(Body::RegisterServiceResult {
            accepted: true,
            reason: None,
        });
        response.msg_id = Some(1);
        response.msg_ack = Some(1);
        assert!(conn.on_envelope(response).is_none());

        let envelope = pending.wait().await.unwrap();
        assert!(matches!(
            envelope.body,
            Body::RegisterServiceResult { accepted: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_close_fails_all_pending() {
        let conn = Connection::new("mmsi://1");
        let pendings: Vec<PendingRequest> = (0..4)
            .map(|_| {
                conn.send_request(Body::FindService {
                    name: "Weather".to_string(),
                    max_distance_m: 1000.0,
                    max_count: 3,
                })
                .unwrap()
            })
            .collect();

        conn.close(CloseReason::Normal);
        assert!(conn.is_closed());

        for pending in pendings {
            assert_eq!(
                pending.wait().await.unwrap_err(),
                RequestError::ConnectionClosed
            );
        }

        assert!(matches!(
            conn.send(position(1.0)),
            Err(SendError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_transport_loss_keeps_pending_requests() {
        let (ta, _ra, _tb, _rb) = transport_pair().await;
        let conn = Connection::new("mmsi://1");
        conn.assign_id("c-1");
        conn.set_transport(ta.clone());

        let pending = conn
            .send_request(Body::RegisterService {
                name: "Ping".to_string(),
            })
            .unwrap();

        // Transport dies; pending requests must survive
        assert!(conn.detach_transport(ta.id()));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.correlator().pending_len(), 1);

        // Response after rebind still resolves it
        let mut response = Envelope::new(Body::RegisterServiceResult {
            accepted: true,
            reason: None,
        });
        response.msg_id = Some(1);
        response.msg_ack = Some(pending.id());
        conn.on_envelope(response);
        assert!(pending.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_rebind_replays_unacked_in_order() {
        let (ta, _ra, _tb, _rb) = transport_pair().await;
        let conn = Connection::new("mmsi://1");
        conn.assign_id("c-1");
        conn.set_transport(ta.clone());

        for i in 0..3 {
            conn.send(position(i as f64)).unwrap();
        }
        conn.detach_transport(ta.id());

        // Fresh transport; remote acked only id 1
        let (tc, _rc, _td, mut rd) = transport_pair().await;
        conn.set_transport(tc);
        conn.resume(1);

        let first = timeout(Duration::from_secs(2), rd.next())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(2), rd.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.msg_id, Some(2));
        assert_eq!(second.msg_id, Some(3));
    }

    #[tokio::test]
    async fn test_set_transport_detaches_previous() {
        let (ta, _ra, _tb, _rb) = transport_pair().await;
        let (tc, _rc, _td, _rd) = transport_pair().await;
        let conn = Connection::new("mmsi://1");
        conn.assign_id("c-1");

        conn.set_transport(ta.clone());
        assert_eq!(ta.bound_connection().as_deref(), Some("c-1"));

        conn.set_transport(tc.clone());
        assert!(ta.bound_connection().is_none());
        assert_eq!(tc.bound_connection().as_deref(), Some("c-1"));
        assert_eq!(conn.bound_transport().unwrap().id(), tc.id());
    }
}
