//! Broadcast fan-out to live connections.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use relay_wire::Body;

use crate::position::PositionTracker;
use crate::registry::TargetRegistry;

/// Fans a broadcast out to every other live connection, optionally
/// geofenced around the sender's last known position.
#[derive(Debug)]
pub struct BroadcastRouter {
    registry: Arc<TargetRegistry>,
    tracker: Arc<PositionTracker>,
}

impl BroadcastRouter {
    /// Build a router over the given registry and tracker
    pub fn new(registry: Arc<TargetRegistry>, tracker: Arc<PositionTracker>) -> Self {
        Self { registry, tracker }
    }

    /// Deliver a broadcast from `sender` to every other live connection.
    ///
    /// Each delivery runs on its own task: one slow or failing recipient
    /// never affects the rest, and the sender is never among them. Returns
    /// the number of deliveries dispatched.
    pub fn broadcast(
        &self,
        sender: &str,
        channel: &str,
        radius_m: Option<f64>,
        ack: bool,
        payload: Value,
    ) -> usize {
        let recipients = match radius_m {
            Some(radius) => match self.tracker.get(sender) {
                Some(origin) => {
                    let within = self.tracker.within(origin.lat, origin.lon, radius);
                    self.registry
                        .connections()
                        .into_iter()
                        .filter(|(identity, _)| {
                            within.iter().any(|(hit, _)| hit == identity)
                        })
                        .collect()
                }
                None => {
                    warn!(
                        "geofenced broadcast from {} with no known position, dropping",
                        sender
                    );
                    return 0;
                }
            },
            None => self.registry.connections(),
        };

        let mut dispatched = 0usize;
        for (identity, connection) in recipients {
            if identity == sender {
                continue;
            }

            let body = Body::BroadcastDeliver {
                channel: channel.to_string(),
                origin: sender.to_string(),
                ack,
                payload: payload.clone(),
            };
            let sender_id = sender.to_string();
            tokio::spawn(async move {
                if let Err(e) = connection.send(body) {
                    warn!(
                        "broadcast from {} to {} failed: {}",
                        sender_id, identity, e
                    );
                }
            });
            dispatched += 1;
        }

        debug!(
            "broadcast on {} from {} dispatched to {} connections",
            channel, sender, dispatched
        );
        dispatched
    }
}
