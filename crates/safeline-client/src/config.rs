//! Client configuration loaded from environment variables.
//!
//! All settings have defaults so the client can start with zero
//! configuration for local development.

use std::path::PathBuf;
use std::time::Duration;

use safeline_shared::constants::{
    DEFAULT_MAX_BLOB_SIZE, DEFAULT_RESPONDER_EMAIL_DOMAIN, DEFAULT_UPLOAD_CHUNK_SIZE,
    GEOLOCATION_MAX_CACHE_AGE_MS, GEOLOCATION_TIMEOUT_SECS, SOS_COUNTDOWN_SECS,
};
use safeline_shared::Position;

use crate::geolocation::PositionOptions;

/// What the session resolver does when the role record cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFallback {
    /// Resolve to the base `user` role and carry on.
    DefaultUser,
    /// Stay in `ResolutionFailed` until the next sign-in event.
    Block,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory holding the database and the blob directory.
    /// Env: `SAFELINE_DATA_DIR`
    /// Default: platform data dir (see `safeline_store::database::default_data_dir`).
    pub data_dir: Option<PathBuf>,

    /// Bytes sent per upload progress step.
    /// Env: `SAFELINE_UPLOAD_CHUNK_SIZE`
    pub upload_chunk_size: usize,

    /// Largest accepted blob.
    /// Env: `SAFELINE_MAX_BLOB_SIZE`
    pub max_blob_size: u64,

    /// SOS countdown length in seconds.
    /// Env: `SAFELINE_SOS_COUNTDOWN_SECS`
    pub sos_countdown_secs: u8,

    /// Options for the single SOS position fix.
    /// Env: `SAFELINE_GEO_TIMEOUT_SECS` (timeout only)
    pub geolocation: PositionOptions,

    /// Env: `SAFELINE_ROLE_FALLBACK` (`user` | `block`)
    /// Default: `user`
    pub role_fallback: RoleFallback,

    /// Domain appended to responder ids to form their sign-in email.
    /// Env: `SAFELINE_RESPONDER_DOMAIN`
    pub responder_email_domain: String,

    /// Fixed position reported by the static geolocator on hosts without a
    /// positioning device.
    /// Env: `SAFELINE_STATIC_POSITION` (`lat,long`)
    pub static_position: Option<Position>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            sos_countdown_secs: SOS_COUNTDOWN_SECS,
            geolocation: PositionOptions {
                high_accuracy: true,
                timeout: Duration::from_secs(GEOLOCATION_TIMEOUT_SECS),
                max_cache_age: Duration::from_millis(GEOLOCATION_MAX_CACHE_AGE_MS),
            },
            role_fallback: RoleFallback::DefaultUser,
            responder_email_domain: DEFAULT_RESPONDER_EMAIL_DOMAIN.to_string(),
            static_position: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("SAFELINE_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Some(val) = lookup("SAFELINE_UPLOAD_CHUNK_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.upload_chunk_size = n,
                _ => tracing::warn!(value = %val, "Invalid SAFELINE_UPLOAD_CHUNK_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("SAFELINE_MAX_BLOB_SIZE") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.max_blob_size = n,
                _ => tracing::warn!(value = %val, "Invalid SAFELINE_MAX_BLOB_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("SAFELINE_SOS_COUNTDOWN_SECS") {
            match val.parse::<u8>() {
                Ok(n) => config.sos_countdown_secs = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid SAFELINE_SOS_COUNTDOWN_SECS, using default")
                }
            }
        }

        if let Some(val) = lookup("SAFELINE_GEO_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.geolocation.timeout = Duration::from_secs(n),
                _ => tracing::warn!(value = %val, "Invalid SAFELINE_GEO_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("SAFELINE_ROLE_FALLBACK") {
            match val.as_str() {
                "user" => config.role_fallback = RoleFallback::DefaultUser,
                "block" => config.role_fallback = RoleFallback::Block,
                _ => tracing::warn!(value = %val, "Invalid SAFELINE_ROLE_FALLBACK, using default"),
            }
        }

        if let Some(domain) = lookup("SAFELINE_RESPONDER_DOMAIN") {
            if !domain.is_empty() {
                config.responder_email_domain = domain;
            }
        }

        if let Some(val) = lookup("SAFELINE_STATIC_POSITION") {
            match val.parse::<Position>() {
                Ok(pos) => config.static_position = Some(pos),
                Err(e) => tracing::warn!(error = %e, "Invalid SAFELINE_STATIC_POSITION, ignoring"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    /// Sign-in email for a responder id.
    pub fn responder_email(&self, responder_id: &str) -> String {
        format!("{}@{}", responder_id.trim(), self.responder_email_domain)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.sos_countdown_secs, 5);
        assert_eq!(config.geolocation.timeout, Duration::from_secs(20));
        assert_eq!(config.geolocation.max_cache_age, Duration::from_secs(1));
        assert!(config.geolocation.high_accuracy);
        assert_eq!(config.role_fallback, RoleFallback::DefaultUser);
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SAFELINE_DATA_DIR", "/tmp/safeline"),
            ("SAFELINE_UPLOAD_CHUNK_SIZE", "1024"),
            ("SAFELINE_ROLE_FALLBACK", "block"),
            ("SAFELINE_STATIC_POSITION", "10.5,-20.25"),
        ]));
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/safeline")));
        assert_eq!(config.upload_chunk_size, 1024);
        assert_eq!(config.role_fallback, RoleFallback::Block);
        assert_eq!(
            config.static_position,
            Some(Position {
                latitude: 10.5,
                longitude: -20.25
            })
        );
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("SAFELINE_UPLOAD_CHUNK_SIZE", "0"),
            ("SAFELINE_GEO_TIMEOUT_SECS", "soon"),
            ("SAFELINE_ROLE_FALLBACK", "maybe"),
        ]));
        assert_eq!(config.upload_chunk_size, DEFAULT_UPLOAD_CHUNK_SIZE);
        assert_eq!(config.geolocation.timeout, Duration::from_secs(20));
        assert_eq!(config.role_fallback, RoleFallback::DefaultUser);
    }

    #[test]
    fn test_responder_email() {
        let config = ClientConfig::default();
        assert_eq!(config.responder_email(" R-17 "), "R-17@responder.safeline");
    }
}
