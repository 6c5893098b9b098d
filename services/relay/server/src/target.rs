//! Server-side Target: one per distinct client identity.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use relay_session::Connection;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

/// One record per identity, living for the server's lifetime.
///
/// A Target survives transport and connection loss: its registered
/// services (and the tracker's position history) stay available for
/// proximity queries while the vessel is offline. At most one live
/// connection is ever attached; takeover is serialized by
/// [`Target::lock`].
pub struct Target {
    identity: String,
    takeover: AsyncMutex<()>,
    connection: Mutex<Option<Arc<Connection>>>,
    services: RwLock<HashSet<String>>,
}

impl Target {
    /// Create a target for `identity` with no connection yet
    pub fn new(identity: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            identity: identity.into(),
            takeover: AsyncMutex::new(()),
            connection: Mutex::new(None),
            services: RwLock::new(HashSet::new()),
        })
    }

    /// Stable identity of this target
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Acquire the per-target lock serializing handshake takeover.
    ///
    /// Every mutation of the current-connection pointer happens under this
    /// guard, so two simultaneous handshakes for the same identity resolve
    /// deterministically: one wins, the other is evicted.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.takeover.lock().await
    }

    /// Currently attached connection, if any
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().unwrap().clone()
    }

    /// Attach a connection (replacing any previous pointer)
    pub fn set_connection(&self, connection: Arc<Connection>) {
        *self.connection.lock().unwrap() = Some(connection);
    }

    /// Record a service offered by this identity. Returns `false` when the
    /// name was already registered.
    pub fn register_service(&self, name: &str) -> bool {
        self.services.write().unwrap().insert(name.to_string())
    }

    /// Remove a service registration
    pub fn unregister_service(&self, name: &str) -> bool {
        self.services.write().unwrap().remove(name)
    }

    /// Whether this identity advertises the named service
    pub fn offers(&self, name: &str) -> bool {
        self.services.read().unwrap().contains(name)
    }

    /// Names of all services this identity advertises
    pub fn services(&self) -> Vec<String> {
        self.services.read().unwrap().iter().cloned().collect()
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("identity", &self.identity)
            .field("has_connection", &self.connection().is_some())
            .field("services", &self.services())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_registration() {
        let target = Target::new("mmsi://1");
        assert!(target.register_service("Ping"));
        assert!(!target.register_service("Ping"));
        assert!(target.offers("Ping"));
        assert!(!target.offers("Weather"));
        assert!(target.unregister_service("Ping"));
        assert!(!target.offers("Ping"));
    }

    #[test]
    fn test_connection_slot() {
        let target = Target::new("mmsi://1");
        assert!(target.connection().is_none());

        let conn = Connection::new("mmsi://1");
        target.set_connection(conn.clone());
        assert!(target.connection().is_some());
    }
}
