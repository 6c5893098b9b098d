//! Service directory: who offers which service, and where.

use std::sync::Arc;

use tracing::debug;

use crate::position::PositionTracker;
use crate::registry::TargetRegistry;

/// Directory of advertised services with proximity lookup.
///
/// Registrations live on the targets themselves (they survive
/// disconnects); the directory is the query surface over the registry and
/// the position tracker.
#[derive(Debug)]
pub struct ServiceDirectory {
    registry: Arc<TargetRegistry>,
    tracker: Arc<PositionTracker>,
}

impl ServiceDirectory {
    /// Build a directory over the given registry and tracker
    pub fn new(registry: Arc<TargetRegistry>, tracker: Arc<PositionTracker>) -> Self {
        Self { registry, tracker }
    }

    /// Record that `identity` offers `name`. Returns `false` when the
    /// registration already existed.
    pub fn register(&self, identity: &str, name: &str) -> bool {
        let newly = self.registry.get_or_create(identity).register_service(name);
        debug!(
            "service {} registered by {} (new: {})",
            name, identity, newly
        );
        newly
    }

    /// Remove a registration
    pub fn unregister(&self, identity: &str, name: &str) -> bool {
        self.registry
            .get(identity)
            .map(|target| target.unregister_service(name))
            .unwrap_or(false)
    }

    /// Identities offering `name` within `max_distance_m` meters of the
    /// origin identity's last known position, ascending by distance,
    /// truncated to `max_count`. The origin itself is never returned.
    pub fn find(
        &self,
        name: &str,
        origin_identity: &str,
        max_distance_m: f64,
        max_count: usize,
    ) -> Vec<String> {
        let Some(origin) = self.tracker.get(origin_identity) else {
            debug!(
                "find_service {}: origin {} has no position",
                name, origin_identity
            );
            return Vec::new();
        };

        let mut hits: Vec<(String, f64)> = self
            .tracker
            .within(origin.lat, origin.lon, max_distance_m)
            .into_iter()
            .filter(|(identity, _)| identity != origin_identity)
            .filter(|(identity, _)| {
                self.registry
                    .get(identity)
                    .map(|target| target.offers(name))
                    .unwrap_or(false)
            })
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits.truncate(max_count);
        hits.into_iter().map(|(identity, _)| identity).collect()
    }
}
