//! Single-shot position capture.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use safeline_shared::{GeolocationError, Position};

/// Options for one position fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix the device may return instead of a fresh one.
    pub max_cache_age: Duration,
}

#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn current_position(&self, options: &PositionOptions)
        -> Result<Position, GeolocationError>;
}

/// Reports a fixed, configured position. Hosts without a positioning device
/// use it; with no position configured every fix is unavailable.
#[derive(Debug, Clone, Default)]
pub struct StaticGeolocator {
    position: Option<Position>,
}

impl StaticGeolocator {
    pub fn new(position: Option<Position>) -> Self {
        Self { position }
    }
}

#[async_trait]
impl Geolocator for StaticGeolocator {
    async fn current_position(
        &self,
        _options: &PositionOptions,
    ) -> Result<Position, GeolocationError> {
        self.position.ok_or_else(|| {
            GeolocationError::Unavailable("no positioning device configured".to_string())
        })
    }
}

/// Ask `geolocator` for one fix, giving up after `options.timeout`.
pub async fn capture_position(
    geolocator: &dyn Geolocator,
    options: &PositionOptions,
) -> Result<Position, GeolocationError> {
    match tokio::time::timeout(options.timeout, geolocator.current_position(options)).await {
        Ok(fix) => fix,
        Err(_) => {
            debug!(timeout_secs = options.timeout.as_secs(), "Position fix timed out");
            Err(GeolocationError::Timeout(options.timeout.as_secs()))
        }
    }
}
