//! Live position tracking with proximity queries.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

/// Mean earth radius in meters
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two coordinates, in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// A vessel's last known position
#[derive(Debug, Clone)]
pub struct PositionFix {
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
    /// When the fix was reported
    pub at: DateTime<Utc>,
}

/// Identity → last known position, with area queries
#[derive(Debug, Default)]
pub struct PositionTracker {
    fixes: DashMap<String, PositionFix>,
}

impl PositionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            fixes: DashMap::new(),
        }
    }

    /// Record the latest position for an identity
    pub fn update(&self, identity: &str, lat: f64, lon: f64) {
        trace!("position update {}: {:.5},{:.5}", identity, lat, lon);
        self.fixes.insert(
            identity.to_string(),
            PositionFix {
                lat,
                lon,
                at: Utc::now(),
            },
        );
    }

    /// Last known position of an identity
    pub fn get(&self, identity: &str) -> Option<PositionFix> {
        self.fixes.get(identity).map(|entry| entry.value().clone())
    }

    /// All identities within `radius_m` meters of the given point, with
    /// their distances. Unordered; callers sort as needed.
    pub fn within(&self, lat: f64, lon: f64, radius_m: f64) -> Vec<(String, f64)> {
        self.fixes
            .iter()
            .filter_map(|entry| {
                let fix = entry.value();
                let distance = haversine_m(lat, lon, fix.lat, fix.lon);
                (distance <= radius_m).then(|| (entry.key().clone(), distance))
            })
            .collect()
    }

    /// Number of tracked identities
    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    /// Whether no identity has reported a position yet
    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Gothenburg to Frederikshavn, roughly 93 km
        let d = haversine_m(57.7089, 11.9746, 57.4407, 10.5366);
        assert!((85_000.0..100_000.0).contains(&d), "got {}", d);
    }

    #[test]
    fn test_haversine_zero_distance() {
        assert_eq!(haversine_m(57.7, 11.97, 57.7, 11.97), 0.0);
    }

    #[test]
    fn test_update_overwrites() {
        let tracker = PositionTracker::new();
        tracker.update("mmsi://1", 57.0, 11.0);
        tracker.update("mmsi://1", 58.0, 12.0);

        let fix = tracker.get("mmsi://1").unwrap();
        assert_eq!(fix.lat, 58.0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_within_filters_by_radius() {
        let tracker = PositionTracker::new();
        tracker.update("near", 57.70, 11.97);
        tracker.update("far", 59.33, 18.07); // Stockholm, ~400 km away

        let hits = tracker.within(57.71, 11.98, 10_000.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "near");
    }
}
