//! Device location acquisition.
//!
//! The pipeline only needs a best-effort fix at the moment of capture, so the
//! provider seam is a simple synchronous trait invoked off the interactive
//! context. `Ok(None)` means "no fix right now" and aborts the capture action
//! with a notice; it is not an error.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::config::{LocationConfig, LocationSource};
use crate::error::PipelineError;

/// A WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Source of the device position at capture time.
pub trait LocationProvider: Send + Sync {
    /// Fetch the current position. May block on I/O.
    fn current_location(&self) -> Result<Option<GeoPoint>, PipelineError>;
}

/// Provider backed by fixed coordinates from the config file.
///
/// Useful for stationary installations (webcams, kiosks) where a live fix
/// adds nothing. Returns `None` when no coordinates are configured.
pub struct FixedLocation {
    point: Option<GeoPoint>,
}

impl FixedLocation {
    pub fn new(point: Option<GeoPoint>) -> Self {
        Self { point }
    }
}

impl LocationProvider for FixedLocation {
    fn current_location(&self) -> Result<Option<GeoPoint>, PipelineError> {
        Ok(self.point)
    }
}

/// Coarse provider that resolves the machine's public IP to coordinates
/// through a geoip JSON endpoint.
pub struct GeoIpLocation {
    endpoint: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct GeoIpResponse {
    lat: Option<f64>,
    lon: Option<f64>,
}

impl GeoIpLocation {
    pub fn new(endpoint: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            endpoint: endpoint.to_string(),
            agent,
        }
    }
}

impl LocationProvider for GeoIpLocation {
    fn current_location(&self) -> Result<Option<GeoPoint>, PipelineError> {
        let response = match self.agent.get(&self.endpoint).call() {
            Ok(r) => r,
            Err(e) => {
                warn!("geoip lookup failed: {}", e);
                return Ok(None);
            }
        };

        let body: GeoIpResponse = match response.into_json() {
            Ok(b) => b,
            Err(e) => {
                warn!("geoip response unreadable: {}", e);
                return Ok(None);
            }
        };

        match (body.lat, body.lon) {
            (Some(lat), Some(lon)) => Ok(Some(GeoPoint::new(lat, lon))),
            _ => Ok(None),
        }
    }
}

/// Build the provider selected in the config file.
pub fn provider_from_config(config: &LocationConfig) -> Box<dyn LocationProvider> {
    match config.source {
        LocationSource::Fixed => {
            let point = match (config.fixed_latitude, config.fixed_longitude) {
                (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
                _ => None,
            };
            Box::new(FixedLocation::new(point))
        }
        LocationSource::GeoIp => Box::new(GeoIpLocation::new(&config.geoip_endpoint)),
    }
}
