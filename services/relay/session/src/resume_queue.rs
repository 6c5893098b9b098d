//! Resuming outbound queue with strictly increasing message ids and
//! cumulative acks.
//!
//! All sequenced sends for one connection flow through a single mutex:
//! the sequence id (and, for requests, the request id) is assigned under
//! the same guard that appends the frame and hands it to the transport,
//! so network order always matches logical order. Acks are cumulative —
//! dropping acked entries is a prefix trim, not a search.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, trace};

use relay_wire::{encode_frame, Envelope, WireError, DEFAULT_MAX_FRAME_SIZE};

use crate::transport::Transport;

/// One queued message: its assigned sequence id and the encoded frame
/// that is replayed verbatim on resume
#[derive(Debug, Clone)]
pub struct Outstanding {
    /// Assigned sequence id
    pub msg_id: u64,
    /// Encoded frame bytes
    pub frame: Bytes,
}

#[derive(Debug)]
struct Inner {
    next_seq: u64,
    next_request: u64,
    unacked: VecDeque<Outstanding>,
}

/// Per-connection outbound buffer that survives transport loss
#[derive(Debug)]
pub struct ResumingQueue {
    inner: Mutex<Inner>,
}

impl ResumingQueue {
    /// Create an empty queue; ids start at 1, 0 is reserved
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seq: 1,
                next_request: 1,
                unacked: VecDeque::new(),
            }),
        }
    }

    /// Assign the next sequence id, queue the message, and hand it to the
    /// bound transport if there is one. Returns the assigned id.
    pub fn write(
        &self,
        envelope: Envelope,
        transport: Option<&Transport>,
    ) -> Result<u64, WireError> {
        self.write_inner(envelope, transport, None::<fn(u64)>)
            .map(|(id, _)| id)
    }

    /// Like [`write`](Self::write), but also assigns the next request id
    /// under the same lock, stamps it as `reply_to`, and passes it to
    /// `register` before the frame can reach the wire. This keeps
    /// request-id order consistent with send order and guarantees the
    /// pending entry exists before any response can arrive.
    pub fn write_request<R>(
        &self,
        envelope: Envelope,
        transport: Option<&Transport>,
        register: impl FnOnce(u64) -> R,
    ) -> Result<(u64, R), WireError> {
        self.write_inner(envelope, transport, Some(register))
            .map(|(id, registered)| (id, registered.unwrap()))
    }

    fn write_inner<R>(
        &self,
        mut envelope: Envelope,
        transport: Option<&Transport>,
        register: Option<impl FnOnce(u64) -> R>,
    ) -> Result<(u64, Option<R>), WireError> {
        let mut inner = self.inner.lock().unwrap();

        let registered = register.map(|register| {
            let request_id = inner.next_request;
            inner.next_request += 1;
            envelope.reply_to = Some(request_id);
            register(request_id)
        });

        let msg_id = inner.next_seq;
        inner.next_seq += 1;
        envelope.msg_id = Some(msg_id);

        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_SIZE)?;
        inner.unacked.push_back(Outstanding {
            msg_id,
            frame: frame.clone(),
        });
        trace!(
            "queued {} msg_id={} unacked={}",
            envelope.body.kind(),
            msg_id,
            inner.unacked.len()
        );

        if let Some(transport) = transport {
            transport.send_frame(frame);
        }

        Ok((msg_id, registered))
    }

    /// Cumulative ack: drop every queued entry with id ≤ `id`. A smaller
    /// or repeated ack is a no-op.
    pub fn ack_up_to(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        while inner
            .unacked
            .front()
            .map(|entry| entry.msg_id <= id)
            .unwrap_or(false)
        {
            inner.unacked.pop_front();
        }
    }

    /// Trim up to `acked`, then replay every remaining entry in id order
    /// onto a fresh transport.
    ///
    /// Replay happens under the writer lock: a concurrent `write` cannot
    /// interleave a higher id between replayed entries, so the remote
    /// always observes ids in increasing order.
    pub fn resume(&self, transport: &Transport, acked: u64) {
        let mut inner = self.inner.lock().unwrap();
        while inner
            .unacked
            .front()
            .map(|entry| entry.msg_id <= acked)
            .unwrap_or(false)
        {
            inner.unacked.pop_front();
        }

        if !inner.unacked.is_empty() {
            debug!(
                "resuming {} unacked messages after ack {}",
                inner.unacked.len(),
                acked
            );
        }
        for entry in &inner.unacked {
            transport.send_frame(entry.frame.clone());
        }
    }

    /// Number of queued (unacked) messages
    pub fn unacked_len(&self) -> usize {
        self.inner.lock().unwrap().unacked.len()
    }

    /// Ids currently queued, in order
    pub fn unacked_ids(&self) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .unacked
            .iter()
            .map(|entry| entry.msg_id)
            .collect()
    }
}

impl Default for ResumingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_wire::Body;

    fn position(lat: f64) -> Envelope {
        Envelope::new(Body::PositionReport { lat, lon: 0.0 })
    }

    #[test]
    fn test_ids_strictly_increase() {
        let queue = ResumingQueue::new();
        for expected in 1..=5u64 {
            let id = queue.write(position(expected as f64), None).unwrap();
            assert_eq!(id, expected);
        }
        assert_eq!(queue.unacked_ids(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cumulative_ack_is_prefix_trim() {
        let queue = ResumingQueue::new();
        for i in 0..5 {
            queue.write(position(i as f64), None).unwrap();
        }

        queue.ack_up_to(3);
        assert_eq!(queue.unacked_ids(), vec![4, 5]);

        // Smaller or equal ack is a no-op
        queue.ack_up_to(3);
        assert_eq!(queue.unacked_ids(), vec![4, 5]);
        queue.ack_up_to(1);
        assert_eq!(queue.unacked_ids(), vec![4, 5]);

        queue.ack_up_to(5);
        assert!(queue.unacked_ids().is_empty());
    }

    #[test]
    fn test_request_id_assigned_under_same_lock() {
        let queue = ResumingQueue::new();

        let (msg_id, request_id) = queue.write_request(position(1.0), None, |id| id).unwrap();
        assert_eq!(msg_id, 1);
        assert_eq!(request_id, 1);

        let (msg_id, request_id) = queue.write_request(position(2.0), None, |id| id).unwrap();
        assert_eq!(msg_id, 2);
        assert_eq!(request_id, 2);

        // Plain writes do not consume request ids
        queue.write(position(3.0), None).unwrap();
        let (_, request_id) = queue.write_request(position(4.0), None, |id| id).unwrap();
        assert_eq!(request_id, 3);
    }

    #[tokio::test]
    async fn test_resume_replays_unacked_suffix_in_order() {
        use crate::transport::{connect_tcp, listen_tcp, Transport};
        use std::net::{IpAddr, Ipv4Addr, SocketAddr};
        use std::time::Duration;
        use tokio::time::timeout;

        let queue = ResumingQueue::new();
        for i in 0..4 {
            queue.write(position(i as f64), None).unwrap();
        }

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        let client = connect_tcp(bound).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (transport, _reader) = Transport::new(client).unwrap();
        let (_remote, mut remote_reader) = Transport::new(server).unwrap();

        queue.resume(&transport, 2);

        // Only ids 3 and 4 replay, in order
        let first = timeout(Duration::from_secs(2), remote_reader.next())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(2), remote_reader.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.msg_id, Some(3));
        assert_eq!(second.msg_id, Some(4));
        assert_eq!(queue.unacked_ids(), vec![3, 4]);
    }
}
