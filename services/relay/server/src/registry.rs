//! Identity → Target registry and the handshake takeover path.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relay_session::{Connection, Transport};
use relay_wire::CloseReason;

use crate::target::Target;

/// Result of promoting a transport through the handshake
#[derive(Debug)]
pub struct HelloOutcome {
    /// The connection now bound to the new transport
    pub connection: Arc<Connection>,
    /// Replay baseline to put in the CONNECTED ack: the highest client
    /// sequence number this connection has already received
    pub last_received_msg_id: u64,
    /// When resuming, the client's acknowledged baseline to replay from
    /// (after CONNECTED has been sent)
    pub resume_from: Option<u64>,
}

/// Maps each stable identity to at most one live connection.
///
/// The registry is the single serialization point for "who owns this
/// identity right now" — but at per-identity granularity: each Target has
/// its own takeover lock, so unrelated identities never contend.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: DashMap<String, Arc<Target>>,
}

impl TargetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
        }
    }

    /// Look up or atomically create the target for an identity
    pub fn get_or_create(&self, identity: &str) -> Arc<Target> {
        self.targets
            .entry(identity.to_string())
            .or_insert_with(|| Target::new(identity))
            .clone()
    }

    /// Target for an identity, if one has ever connected
    pub fn get(&self, identity: &str) -> Option<Arc<Target>> {
        self.targets.get(identity).map(|entry| entry.value().clone())
    }

    /// O(1) lookup of the live connection for an identity, used by relay
    /// and RPC forwarding
    pub fn connection(&self, identity: &str) -> Option<Arc<Connection>> {
        self.get(identity)
            .and_then(|target| target.connection())
            .filter(|connection| !connection.is_closed())
    }

    /// Every identity with a non-closed connection
    pub fn connections(&self) -> Vec<(String, Arc<Connection>)> {
        self.targets
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .connection()
                    .filter(|connection| !connection.is_closed())
                    .map(|connection| (entry.key().clone(), connection))
            })
            .collect()
    }

    /// Promote a handshaken transport to a bound connection.
    ///
    /// Runs entirely under the target's takeover lock: a still-bound older
    /// transport is force-closed with `DuplicateConnect` and detached, then
    /// the new transport is bound to either the resumed connection (when
    /// the reconnect token names it) or a freshly created one.
    pub async fn on_hello(
        &self,
        transport: Arc<Transport>,
        identity: &str,
        reconnect_token: Option<&str>,
        client_last_received: u64,
    ) -> HelloOutcome {
        let target = self.get_or_create(identity);
        let _guard = target.lock().await;

        let existing = target.connection();

        // Evict a stale transport before anything else: exactly one
        // transport per identity, ever.
        if let Some(ref connection) = existing {
            if let Some(old) = connection.bound_transport() {
                warn!(
                    "duplicate connect for {}: evicting transport {}",
                    identity,
                    old.id()
                );
                connection.detach_transport(old.id());
                old.close(CloseReason::DuplicateConnect);
            }
        }

        let resumable = existing.as_ref().is_some_and(|connection| {
            !connection.is_closed()
                && reconnect_token.is_some()
                && connection.id().as_deref() == reconnect_token
        });

        let connection = if resumable {
            let connection = existing.clone().unwrap();
            debug!(
                "resuming connection {} for {}",
                connection.id().unwrap_or_default(),
                identity
            );
            connection
        } else {
            if let Some(old) = existing {
                // Discarded, not resumed: its pending requests must fail now
                old.close(CloseReason::DuplicateConnect);
            }
            let connection = Connection::new(identity);
            connection.assign_id(Uuid::new_v4().to_string());
            info!(
                "new connection {} for {}",
                connection.id().unwrap_or_default(),
                identity
            );
            connection
        };

        connection.set_transport(transport);
        target.set_connection(connection.clone());

        HelloOutcome {
            last_received_msg_id: connection.last_received(),
            resume_from: resumable.then_some(client_last_received),
            connection,
        }
    }

    /// A transport died. Detach it if it is still the one bound to this
    /// identity's connection; the target itself survives for reconnect.
    pub fn on_transport_closed(&self, identity: &str, transport: &Transport) {
        if let Some(target) = self.get(identity) {
            if let Some(connection) = target.connection() {
                if connection.detach_transport(transport.id()) {
                    debug!("{} disconnected, target retained", identity);
                }
            }
        }
    }

    /// Number of known targets (connected or not)
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether no identity has ever connected
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_session::{connect_tcp, listen_tcp, TransportReader};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn transport() -> (Arc<Transport>, TransportReader, TransportReader) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        let client = connect_tcp(bound).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (t, server_reader) = Transport::new(server).unwrap();
        let (_tc, client_reader) = Transport::new(client).unwrap();
        (t, server_reader, client_reader)
    }

    #[tokio::test]
    async fn test_create_if_absent_is_single() {
        let registry = TargetRegistry::new();
        let a = registry.get_or_create("mmsi://1");
        let b = registry.get_or_create("mmsi://1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_hello_binds_fresh_connection() {
        let registry = TargetRegistry::new();
        let (t, _sr, _cr) = transport().await;

        let outcome = registry.on_hello(t.clone(), "mmsi://1", None, 0).await;
        assert_eq!(outcome.last_received_msg_id, 0);
        assert!(outcome.resume_from.is_none());
        assert!(outcome.connection.id().is_some());
        assert_eq!(
            registry.connection("mmsi://1").unwrap().id(),
            outcome.connection.id()
        );
        assert_eq!(t.bound_connection(), outcome.connection.id());
    }

    #[tokio::test]
    async fn test_second_hello_evicts_first_transport() {
        let registry = TargetRegistry::new();
        let (t1, _sr1, mut peer1) = transport().await;
        let (t2, _sr2, _peer2) = transport().await;

        let first = registry.on_hello(t1.clone(), "mmsi://1", None, 0).await;
        let second = registry.on_hello(t2.clone(), "mmsi://1", None, 0).await;

        // The loser's peer observes a DuplicateConnect close
        let err = timeout(Duration::from_secs(2), peer1.next())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, CloseReason::DuplicateConnect);
        assert!(t1.is_closed());

        // Exactly one surviving connection, bound to the new transport
        let surviving = registry.connection("mmsi://1").unwrap();
        assert_eq!(surviving.id(), second.connection.id());
        assert_ne!(first.connection.id(), second.connection.id());
        assert!(first.connection.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_hellos_single_owner() {
        let registry = Arc::new(TargetRegistry::new());
        let (t1, _sr1, _cr1) = transport().await;
        let (t2, _sr2, _cr2) = transport().await;

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.on_hello(t1, "mmsi://9", None, 0).await }),
            tokio::spawn(async move { r2.on_hello(t2, "mmsi://9", None, 0).await }),
        );
        let a = a.unwrap();
        let b = b.unwrap();

        // Deterministic outcome: exactly one connection survives with a
        // bound transport, the other was evicted
        let survivors = [&a, &b]
            .iter()
            .filter(|outcome| {
                !outcome.connection.is_closed() && outcome.connection.bound_transport().is_some()
            })
            .count();
        assert_eq!(survivors, 1);
    }

    #[tokio::test]
    async fn test_reconnect_token_resumes_connection() {
        let registry = TargetRegistry::new();
        let (t1, _sr1, _cr1) = transport().await;

        let first = registry.on_hello(t1.clone(), "mmsi://1", None, 0).await;
        let connection_id = first.connection.id().unwrap();

        // Transport dies; target and connection survive
        registry.on_transport_closed("mmsi://1", &t1);
        assert!(registry.get("mmsi://1").is_some());
        assert!(first.connection.bound_transport().is_none());
        assert!(!first.connection.is_closed());

        // Reconnect with the token: same connection, resume requested
        let (t2, _sr2, _cr2) = transport().await;
        let second = registry
            .on_hello(t2.clone(), "mmsi://1", Some(&connection_id), 3)
            .await;
        assert_eq!(second.connection.id().as_deref(), Some(&connection_id[..]));
        assert_eq!(second.resume_from, Some(3));
        assert!(Arc::ptr_eq(&first.connection, &second.connection));
    }

    #[tokio::test]
    async fn test_stale_token_gets_fresh_connection() {
        let registry = TargetRegistry::new();
        let (t1, _sr1, _cr1) = transport().await;
        registry.on_hello(t1.clone(), "mmsi://1", None, 0).await;
        registry.on_transport_closed("mmsi://1", &t1);

        let (t2, _sr2, _cr2) = transport().await;
        let outcome = registry
            .on_hello(t2, "mmsi://1", Some("not-a-known-connection"), 0)
            .await;
        assert!(outcome.resume_from.is_none());
    }

    #[tokio::test]
    async fn test_target_survives_disconnect() {
        let registry = TargetRegistry::new();
        let (t, _sr, _cr) = transport().await;

        let outcome = registry.on_hello(t.clone(), "mmsi://1", None, 0).await;
        registry
            .get("mmsi://1")
            .unwrap()
            .register_service("Weather");

        registry.on_transport_closed("mmsi://1", &t);

        // Position/service history must survive the disconnect
        let target = registry.get("mmsi://1").unwrap();
        assert!(target.offers("Weather"));
        assert!(!outcome.connection.is_closed());
        // But it no longer counts as a live connection for relaying
        assert!(registry.connection("mmsi://1").is_some());
    }
}
