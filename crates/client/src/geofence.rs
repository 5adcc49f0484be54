//! Geolocation gate.
//!
//! Wraps the device positioning service and enforces that closures are
//! submitted on site: the technician must be within a radius (200 m by
//! default) of the ticket's branch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default geofence radius around a site, in meters.
pub const DEFAULT_RADIUS_M: f64 = 200.0;

/// Positioning timeout; no cached fix is ever accepted instead.
pub const LOCATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
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

/// A device fix.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub point: GeoPoint,
    /// Reported accuracy radius in meters, when the device provides one.
    pub accuracy: Option<f64>,
}

/// Options passed to the positioning service.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Maximum age of a cached fix; zero forces a fresh reading.
    pub maximum_age: Duration,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: LOCATION_TIMEOUT,
            maximum_age: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("timed out waiting for a location fix")]
    Timeout,
    #[error("location unavailable: {0}")]
    Unavailable(String),
}

impl LocationError {
    pub fn user_message(&self) -> &'static str {
        match self {
            LocationError::PermissionDenied => {
                "Location access is blocked. Allow location access to close this job."
            }
            LocationError::Timeout => {
                "Could not get your location in time. Move to an open area and try again."
            }
            LocationError::Unavailable(_) => "Your location is currently unavailable.",
        }
    }
}

/// Device positioning service.
#[async_trait]
pub trait PositionProvider: Send + Sync {
    async fn current_position(&self, options: &PositionOptions) -> Result<Position, LocationError>;
}

/// Outcome of checking a fix against a site.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceResult {
    pub distance_meters: f64,
    pub valid: bool,
    pub accuracy: Option<f64>,
}

/// Live indicator shown while the closure form is open.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceStatus {
    Checking,
    InRange,
    OutOfRange,
}

impl GeofenceStatus {
    pub fn from_result(result: Option<&GeofenceResult>) -> Self {
        match result {
            None => GeofenceStatus::Checking,
            Some(r) if r.valid => GeofenceStatus::InRange,
            Some(_) => GeofenceStatus::OutOfRange,
        }
    }
}

/// Great-circle distance between two coordinates, in meters (haversine).
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub fn distance_between(a: GeoPoint, b: GeoPoint) -> f64 {
    distance(a.latitude, a.longitude, b.latitude, b.longitude)
}

pub fn is_within_radius(a: GeoPoint, b: GeoPoint, radius_m: f64) -> bool {
    distance_between(a, b) <= radius_m
}

pub fn check(position: &Position, site: GeoPoint, radius_m: f64) -> GeofenceResult {
    let distance_meters = distance_between(position.point, site);
    GeofenceResult {
        distance_meters,
        valid: distance_meters <= radius_m,
        accuracy: position.accuracy,
    }
}

/// Requests fresh fixes from the device with a hard client-side timeout.
#[derive(Clone)]
pub struct Geolocator {
    provider: Arc<dyn PositionProvider>,
    options: PositionOptions,
}

impl Geolocator {
    pub fn new(provider: Arc<dyn PositionProvider>) -> Self {
        Self {
            provider,
            options: PositionOptions::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// A fresh, high-accuracy fix.
    pub async fn locate(&self) -> Result<Position, LocationError> {
        // Enforced here as well, in case the provider ignores `options.timeout`.
        match tokio::time::timeout(
            self.options.timeout,
            self.provider.current_position(&self.options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LocationError::Timeout),
        }
    }

    pub async fn get_coordinates(&self) -> Result<GeoPoint, LocationError> {
        self.locate().await.map(|p| p.point)
    }

    /// Locate the device and check it against `site`.
    pub async fn check_site(&self, site: GeoPoint, radius_m: f64) -> Result<GeofenceResult, LocationError> {
        let position = self.locate().await?;
        let result = check(&position, site, radius_m);
        tracing::debug!(
            distance_m = result.distance_meters,
            radius_m,
            valid = result.valid,
            "geofence check"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for Geolocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geolocator")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
