//! Request/response correlation.
//!
//! Every message expecting a reply gets a pending entry keyed by its
//! request id. A response bearing the matching `msg_ack` resolves the
//! entry exactly once; closing the owning connection fails every entry so
//! callers are never left hanging. The timeout/response race is settled by
//! map removal: whichever side removes the entry is authoritative.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use relay_wire::Envelope;

/// Terminal failure of a pending request
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// No response arrived within the caller's deadline
    #[error("request timed out")]
    Timeout,

    /// The owning connection closed before a response arrived
    #[error("connection closed")]
    ConnectionClosed,
}

type PendingSender = oneshot::Sender<Result<Envelope, RequestError>>;

/// Pending-request table for one connection
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: DashMap<u64, PendingSender>,
    orphans: AtomicU64,
}

impl RequestCorrelator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            orphans: AtomicU64::new(0),
        }
    }

    /// Register a pending entry for `request_id`, returning the receiver
    /// the caller waits on
    pub fn register(&self, request_id: u64) -> oneshot::Receiver<Result<Envelope, RequestError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        rx
    }

    /// Resolve the pending entry matching a response envelope.
    ///
    /// An orphan reply (no matching entry) is logged and counted, not
    /// fatal: the caller may have timed out, or the peer is desynced.
    pub fn on_response(&self, request_id: u64, envelope: Envelope) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, tx)) => {
                // A dropped receiver just means the caller stopped waiting
                let _ = tx.send(Ok(envelope));
                true
            }
            None => {
                self.orphans.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "orphan reply for unknown request id {} ({})",
                    request_id,
                    envelope.body.kind()
                );
                false
            }
        }
    }

    /// Remove a pending entry without resolving it. Returns whether the
    /// entry was still present — the caller owns the outcome only if so.
    pub fn abandon(&self, request_id: u64) -> bool {
        self.pending.remove(&request_id).is_some()
    }

    /// Fail every pending entry. Used when the owning connection closes.
    pub fn fail_all(&self, error: RequestError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0usize;
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(error));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!("failed {} pending requests: {}", failed, error);
        }
    }

    /// Number of replies that matched no pending request
    pub fn orphan_count(&self) -> u64 {
        self.orphans.load(Ordering::Relaxed)
    }

    /// Number of requests currently awaiting a response
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// A not-yet-resolved request handle.
///
/// Exactly one of four terminal outcomes happens: a response envelope, a
/// typed application failure inside that envelope, [`RequestError::Timeout`],
/// or [`RequestError::ConnectionClosed`].
#[derive(Debug)]
pub struct PendingRequest {
    request_id: u64,
    correlator: Arc<RequestCorrelator>,
    rx: oneshot::Receiver<Result<Envelope, RequestError>>,
}

impl PendingRequest {
    /// Pair a registered receiver with its correlator entry
    pub fn new(
        request_id: u64,
        correlator: Arc<RequestCorrelator>,
        rx: oneshot::Receiver<Result<Envelope, RequestError>>,
    ) -> Self {
        Self {
            request_id,
            correlator,
            rx,
        }
    }

    /// The request id stamped on the wire
    pub fn id(&self) -> u64 {
        self.request_id
    }

    /// Wait for the response with no deadline
    pub async fn wait(self) -> Result<Envelope, RequestError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::ConnectionClosed),
        }
    }

    /// Wait for the response, failing with [`RequestError::Timeout`] after
    /// `deadline`. Race-safe against a concurrent late response: whichever
    /// of timeout and response removes the pending entry wins.
    pub async fn wait_timeout(mut self, deadline: Duration) -> Result<Envelope, RequestError> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed),
            Err(_) => {
                if self.correlator.abandon(self.request_id) {
                    Err(RequestError::Timeout)
                } else {
                    // The response won the race; it is already in flight
                    match self.rx.await {
                        Ok(result) => result,
                        Err(_) => Err(RequestError::ConnectionClosed),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_wire::Body;

    fn response(ack: u64) -> Envelope {
        let mut env = Envelope::new(Body::RegisterServiceResult {
            accepted: true,
            reason: None,
        });
        env.msg_ack = Some(ack);
        env
    }

    #[tokio::test]
    async fn test_exactly_one_resolution() {
        let correlator = Arc::new(RequestCorrelator::new());

        let rx = correlator.register(1);
        let pending = PendingRequest::new(1, correlator.clone(), rx);

        assert!(correlator.on_response(1, response(1)));
        // Second response for the same id is an orphan
        assert!(!correlator.on_response(1, response(1)));
        assert_eq!(correlator.orphan_count(), 1);

        let envelope = pending.wait().await.unwrap();
        assert_eq!(envelope.msg_ack, Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let correlator = Arc::new(RequestCorrelator::new());

        let pendings: Vec<PendingRequest> = (1..=8u64)
            .map(|id| PendingRequest::new(id, correlator.clone(), correlator.register(id)))
            .collect();

        // Resolve in reverse order
        for id in (1..=8u64).rev() {
            assert!(correlator.on_response(id, response(id)));
        }

        for (i, pending) in pendings.into_iter().enumerate() {
            let envelope = pending.wait().await.unwrap();
            assert_eq!(envelope.msg_ack, Some(i as u64 + 1));
        }
        assert_eq!(correlator.orphan_count(), 0);
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_orphan_reply_resolves_nothing() {
        let correlator = Arc::new(RequestCorrelator::new());
        let _rx = correlator.register(1);

        assert!(!correlator.on_response(99, response(99)));
        assert_eq!(correlator.orphan_count(), 1);
        assert_eq!(correlator.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_drains_every_pending() {
        let correlator = Arc::new(RequestCorrelator::new());

        let pendings: Vec<PendingRequest> = (1..=5u64)
            .map(|id| PendingRequest::new(id, correlator.clone(), correlator.register(id)))
            .collect();

        correlator.fail_all(RequestError::ConnectionClosed);
        assert_eq!(correlator.pending_len(), 0);

        for pending in pendings {
            assert_eq!(
                pending.wait().await.unwrap_err(),
                RequestError::ConnectionClosed
            );
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let correlator = Arc::new(RequestCorrelator::new());
        let pending = PendingRequest::new(7, correlator.clone(), correlator.register(7));

        let result = pending.wait_timeout(Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), RequestError::Timeout);
        assert_eq!(correlator.pending_len(), 0);

        // A late response is now an orphan
        assert!(!correlator.on_response(7, response(7)));
        assert_eq!(correlator.orphan_count(), 1);
    }

    #[tokio::test]
    async fn test_response_beats_timeout() {
        let correlator = Arc::new(RequestCorrelator::new());
        let pending = PendingRequest::new(3, correlator.clone(), correlator.register(3));

        assert!(correlator.on_response(3, response(3)));
        let envelope = pending
            .wait_timeout(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(envelope.msg_ack, Some(3));
    }
}
