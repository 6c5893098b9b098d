//! Keepalive with PING/PONG and RTT measurement.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use relay_wire::Body;

/// Build a PING body with a correlation id for RTT measurement
pub fn ping_body(corr_id: u64) -> Body {
    Body::Ping { corr_id }
}

/// Build the PONG body answering a PING
pub fn pong_body(corr_id: u64) -> Body {
    Body::Pong { corr_id }
}

/// Generate a correlation ID based on monotonic time
pub fn now_corr_id() -> u64 {
    static START: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    let elapsed_ns = START.elapsed().as_nanos();
    (elapsed_ns & 0xFFFF_FFFF_FFFF_FFFF) as u64
}

/// Outstanding-ping tracking for RTT measurement
#[derive(Debug, Default)]
pub struct KeepaliveState {
    outstanding: HashMap<u64, Instant>,
}

impl KeepaliveState {
    /// Record a PING being sent
    pub fn record_ping(&mut self, corr_id: u64) {
        self.outstanding.insert(corr_id, Instant::now());

        // Clean up old entries (older than 60 seconds)
        let cutoff = Instant::now() - Duration::from_secs(60);
        self.outstanding.retain(|_, &mut time| time > cutoff);
    }

    /// Process a PONG and return RTT if the correlation ID was found
    pub fn process_pong(&mut self, corr_id: u64) -> Option<Duration> {
        self.outstanding
            .remove(&corr_id)
            .map(|send_time| send_time.elapsed())
    }

    /// Number of pings still awaiting a pong
    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }
}
