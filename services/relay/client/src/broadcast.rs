//! Broadcast subscriptions and delivery dispatch.
//!
//! Components subscribe to channels explicitly at construction time; there
//! is no scanning or implicit wiring. Each delivery invokes every listener
//! on its own task so a slow or panicking listener cannot affect the
//! others, or the transport read path.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

/// One delivered broadcast
#[derive(Debug, Clone)]
pub struct BroadcastEvent {
    /// Channel the broadcast was sent on
    pub channel: String,
    /// Identity of the broadcasting vessel
    pub origin: String,
    /// Broadcast payload
    pub payload: Value,
}

/// A broadcast listener callback
pub type BroadcastListener = Arc<dyn Fn(BroadcastEvent) + Send + Sync>;

/// Channel → listeners table
#[derive(Default)]
pub struct BroadcastSubscriptions {
    listeners: RwLock<HashMap<String, Vec<BroadcastListener>>>,
}

impl BroadcastSubscriptions {
    /// Create an empty subscription table
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Add a listener for a channel. Multiple listeners per channel are
    /// allowed; each receives every delivery.
    pub fn subscribe(&self, channel: &str, listener: BroadcastListener) {
        self.listeners
            .write()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(listener);
    }

    /// Number of listeners on a channel
    pub fn listener_count(&self, channel: &str) -> usize {
        self.listeners
            .read()
            .unwrap()
            .get(channel)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Dispatch a delivery to every listener of its channel, each on an
    /// independent task. A listener panic is logged, never propagated.
    pub fn dispatch(&self, event: BroadcastEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap()
            .get(&event.channel)
            .cloned()
            .unwrap_or_default();

        if listeners.is_empty() {
            debug!("broadcast on {} with no listeners, dropping", event.channel);
            return;
        }

        for listener in listeners {
            let event = event.clone();
            let channel = event.channel.clone();
            tokio::spawn(async move {
                let run = tokio::spawn(async move { listener(event) });
                if let Err(e) = run.await {
                    warn!("broadcast listener on {} panicked: {}", channel, e);
                }
            });
        }
    }
}

impl std::fmt::Debug for BroadcastSubscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels: Vec<String> = self.listeners.read().unwrap().keys().cloned().collect();
        f.debug_struct("BroadcastSubscriptions")
            .field("channels", &channels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn event(channel: &str) -> BroadcastEvent {
        BroadcastEvent {
            channel: channel.to_string(),
            origin: "mmsi://1".to_string(),
            payload: serde_json::json!({"n": 1}),
        }
    }

    #[tokio::test]
    async fn test_every_listener_fires() {
        let subs = BroadcastSubscriptions::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            let tx = tx.clone();
            subs.subscribe(
                "weather",
                Arc::new(move |event| {
                    tx.send((i, event.origin.clone())).unwrap();
                }),
            );
        }
        assert_eq!(subs.listener_count("weather"), 3);

        subs.dispatch(event("weather"));

        for _ in 0..3 {
            let (_, origin) = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(origin, "mmsi://1");
        }
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_break_others() {
        let subs = BroadcastSubscriptions::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        subs.subscribe("alerts", Arc::new(|_| panic!("bad listener")));
        let tx2 = tx.clone();
        subs.subscribe(
            "alerts",
            Arc::new(move |event| {
                tx2.send(event.channel).unwrap();
            }),
        );

        subs.dispatch(event("alerts"));

        let channel = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel, "alerts");
    }

    #[tokio::test]
    async fn test_unsubscribed_channel_is_dropped() {
        let subs = BroadcastSubscriptions::new();
        // Must not panic or leak
        subs.dispatch(event("nobody-listens"));
        assert_eq!(subs.listener_count("nobody-listens"), 0);
    }
}
