//! Reverse geocoding of capture coordinates to a street address.
//!
//! Address lookup is strictly best-effort: every failure path collapses to
//! `None` after logging, and the caller substitutes a placeholder string.
//! A missing address must never abort a capture action.

use std::time::Duration;
use tracing::debug;

use crate::location::GeoPoint;

/// Placeholder rendered into the watermark when no address is available.
pub const UNKNOWN_LOCATION: &str = "Unknown Location";

pub trait ReverseGeocoder: Send + Sync {
    /// Resolve coordinates to a human-readable address line, if possible.
    fn address(&self, point: &GeoPoint) -> Option<String>;
}

/// Geocoder backed by a Nominatim-style `/reverse` HTTP endpoint.
pub struct HttpGeocoder {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpGeocoder {
    pub fn new(endpoint: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("geoshot/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            endpoint: endpoint.to_string(),
            agent,
        }
    }
}

impl ReverseGeocoder for HttpGeocoder {
    fn address(&self, point: &GeoPoint) -> Option<String> {
        let response = self
            .agent
            .get(&self.endpoint)
            .query("format", "jsonv2")
            .query("lat", &point.latitude.to_string())
            .query("lon", &point.longitude.to_string())
            .call();

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!("reverse geocode request failed: {}", e);
                return None;
            }
        };

        let body: serde_json::Value = match response.into_json() {
            Ok(b) => b,
            Err(e) => {
                debug!("reverse geocode response unreadable: {}", e);
                return None;
            }
        };

        body.get("display_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}

/// Geocoder that never resolves anything, for offline deployments.
pub struct NoGeocoder;

impl ReverseGeocoder for NoGeocoder {
    fn address(&self, _point: &GeoPoint) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_geocoder_always_degrades() {
        let point = GeoPoint::new(51.5074, -0.1278);
        assert_eq!(NoGeocoder.address(&point), None);
    }
}
