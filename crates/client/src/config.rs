//! Agent configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{HttpBackendConfig, ObjectStorage};
use crate::geofence::{DEFAULT_RADIUS_M, Geolocator, PositionProvider};
use crate::images::ImageUploader;
use crate::types::MAX_RETRIES;

pub const DEFAULT_API_URL: &str = "http://localhost:54321";
pub const DEFAULT_BUCKET: &str = "ticket-photos";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub storage_bucket: String,
    /// `None` means the default location under the OS data directory.
    pub outbox_path: Option<PathBuf>,
    pub geofence_radius_m: f64,
    pub upload_timeout: Duration,
    pub location_timeout: Duration,
    pub max_retries: u32,
    pub probe_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            auth_token: None,
            storage_bucket: DEFAULT_BUCKET.to_string(),
            outbox_path: None,
            geofence_radius_m: DEFAULT_RADIUS_M,
            upload_timeout: Duration::from_secs(30),
            location_timeout: Duration::from_secs(10),
            max_retries: MAX_RETRIES,
            probe_interval: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Malformed numbers keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            api_url: get("FIELDOPS_API_URL").unwrap_or(defaults.api_url),
            api_key: get("FIELDOPS_API_KEY"),
            auth_token: get("FIELDOPS_AUTH_TOKEN"),
            storage_bucket: get("FIELDOPS_STORAGE_BUCKET").unwrap_or(defaults.storage_bucket),
            outbox_path: get("FIELDOPS_OUTBOX_PATH").map(PathBuf::from),
            geofence_radius_m: parse_or(
                "FIELDOPS_GEOFENCE_RADIUS_M",
                get("FIELDOPS_GEOFENCE_RADIUS_M"),
                defaults.geofence_radius_m,
            )
            .max(0.0),
            upload_timeout: secs_or(
                "FIELDOPS_UPLOAD_TIMEOUT_SECS",
                get("FIELDOPS_UPLOAD_TIMEOUT_SECS"),
                defaults.upload_timeout,
            ),
            location_timeout: secs_or(
                "FIELDOPS_LOCATION_TIMEOUT_SECS",
                get("FIELDOPS_LOCATION_TIMEOUT_SECS"),
                defaults.location_timeout,
            ),
            max_retries: parse_or(
                "FIELDOPS_MAX_RETRIES",
                get("FIELDOPS_MAX_RETRIES"),
                defaults.max_retries,
            )
            .max(1),
            probe_interval: secs_or(
                "FIELDOPS_PROBE_INTERVAL_SECS",
                get("FIELDOPS_PROBE_INTERVAL_SECS"),
                defaults.probe_interval,
            ),
        }
    }

    pub fn backend_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            api_key: self.api_key.clone(),
            auth_token: self.auth_token.clone(),
            bucket: self.storage_bucket.clone(),
            upload_timeout: self.upload_timeout,
            ..HttpBackendConfig::new(self.api_url.clone())
        }
    }

    pub fn image_uploader(&self, storage: Arc<dyn ObjectStorage>) -> ImageUploader {
        ImageUploader::new(storage).with_timeout(self.upload_timeout)
    }

    pub fn geolocator(&self, provider: Arc<dyn PositionProvider>) -> Geolocator {
        Geolocator::new(provider).with_timeout(self.location_timeout)
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid value, using default");
            default
        }),
    }
}

fn secs_or(key: &str, raw: Option<String>, default: Duration) -> Duration {
    let secs = parse_or(key, raw, default.as_secs());
    if secs == 0 {
        tracing::warn!(key, "zero duration, using default");
        return default;
    }
    Duration::from_secs(secs)
}
