//! Camera and stream configuration
//!
//! Cameras come from the dashboard backend as `{ id, base_url, enabled }`.
//! Stream tuning has defaults that can be overridden from a JSON config file
//! and then from `CAMSTREAM_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::accumulator::DEFAULT_MAX_BUFFER_BYTES;
use crate::scanner::DEFAULT_BOUNDARY;

/// Environment variable overriding [`StreamConfig::max_buffer_bytes`]
pub const ENV_MAX_BUFFER_BYTES: &str = "CAMSTREAM_MAX_BUFFER_BYTES";
/// Environment variable overriding [`StreamConfig::boundary`]
pub const ENV_BOUNDARY: &str = "CAMSTREAM_BOUNDARY";
/// Environment variable overriding [`StreamConfig::connect_timeout_ms`]
pub const ENV_CONNECT_TIMEOUT_MS: &str = "CAMSTREAM_CONNECT_TIMEOUT_MS";
/// Environment variable overriding [`StreamConfig::idle_timeout_ms`]
pub const ENV_IDLE_TIMEOUT_MS: &str = "CAMSTREAM_IDLE_TIMEOUT_MS";

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for the expected shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A camera's base URL cannot be turned into a stream URL.
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A stream setting is out of range.
    #[error("invalid {field}: {reason}")]
    InvalidSetting {
        /// Name of the setting.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// One camera as described by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera identifier, used in the stream path
    pub id: String,
    /// Backend base URL, e.g. `https://home.local/api`
    pub base_url: String,
    /// Whether the camera should be streaming
    #[serde(default)]
    pub enabled: bool,
}

impl CameraConfig {
    /// Create a config
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, enabled: bool) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            enabled,
        }
    }

    /// `{base_url}/cameras/{id}/stream`
    ///
    /// The id is percent-encoded as a single path segment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if the base URL does not parse or
    /// cannot carry a path (e.g. `mailto:`).
    pub fn stream_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: self.base_url.clone(),
            reason,
        };

        let mut url = Url::parse(&self.base_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("base url cannot have a path".to_string()))?
            .pop_if_empty()
            .extend(["cameras", self.id.as_str(), "stream"]);
        Ok(url)
    }

    /// Whether switching to `other` requires a new session
    pub fn same_stream(&self, other: &CameraConfig) -> bool {
        self.id == other.id && self.base_url == other.base_url
    }
}

/// Stream client tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Ceiling for bytes buffered while waiting for a complete frame
    pub max_buffer_bytes: usize,
    /// Multipart boundary token
    pub boundary: String,
    /// TCP/TLS connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Fail the session if no chunk arrives for this long (0 = never)
    pub idle_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            boundary: DEFAULT_BOUNDARY.to_string(),
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 15_000,
        }
    }
}

impl StreamConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from `lookup`, normally `std::env::var`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_MAX_BUFFER_BYTES) {
            match value.trim().parse::<usize>() {
                Ok(bytes) if bytes > 0 => self.max_buffer_bytes = bytes,
                _ => log::warn!(
                    "Ignoring {}='{}', keeping {}",
                    ENV_MAX_BUFFER_BYTES,
                    value,
                    self.max_buffer_bytes
                ),
            }
        }
        if let Some(value) = lookup(ENV_BOUNDARY) {
            self.boundary = value;
        }
        if let Some(value) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.connect_timeout_ms = ms,
                Err(_) => log::warn!(
                    "Ignoring {}='{}', keeping {}",
                    ENV_CONNECT_TIMEOUT_MS,
                    value,
                    self.connect_timeout_ms
                ),
            }
        }
        if let Some(value) = lookup(ENV_IDLE_TIMEOUT_MS) {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.idle_timeout_ms = ms,
                Err(_) => log::warn!(
                    "Ignoring {}='{}', keeping {}",
                    ENV_IDLE_TIMEOUT_MS,
                    value,
                    self.idle_timeout_ms
                ),
            }
        }
    }

    /// Check settings that would make every stream fail.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSetting`] if `max_buffer_bytes` is 0.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffer_bytes == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "max_buffer_bytes",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout as a `Duration`, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Top-level config file for the `camstream` binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Stream tuning
    #[serde(default)]
    pub stream: StreamConfig,
    /// Cameras to manage
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

impl DashboardConfig {
    /// Read a JSON config file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Json`] if it does not parse,
    /// [`ConfigError::InvalidSetting`] if the stream settings are unusable, or
    /// [`ConfigError::InvalidUrl`] if any camera has an unusable base URL.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&text)?;
        config.stream.apply_env(|key| std::env::var(key).ok());
        config.stream.validate()?;

        for camera in &config.cameras {
            camera.stream_url()?;
        }

        log::info!(
            "Loaded {} camera(s) from {}",
            config.cameras.len(),
            path.display()
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_stream_url_appends_path() {
        let camera = CameraConfig::new("porch", "https://home.local/api", true);
        assert_eq!(
            camera.stream_url().unwrap().as_str(),
            "https://home.local/api/cameras/porch/stream"
        );
    }

    #[test]
    fn test_stream_url_trailing_slash() {
        let camera = CameraConfig::new("porch", "https://home.local/api/", true);
        assert_eq!(
            camera.stream_url().unwrap().as_str(),
            "https://home.local/api/cameras/porch/stream"
        );
    }

    #[test]
    fn test_stream_url_encodes_id() {
        let camera = CameraConfig::new("back yard/1", "http://10.0.0.2:8080", true);
        assert_eq!(
            camera.stream_url().unwrap().as_str(),
            "http://10.0.0.2:8080/cameras/back%20yard%2F1/stream"
        );
    }

    #[test]
    fn test_stream_url_rejects_bad_base() {
        let camera = CameraConfig::new("porch", "not a url", true);
        assert!(matches!(
            camera.stream_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));

        let camera = CameraConfig::new("porch", "mailto:someone@example.com", true);
        assert!(matches!(
            camera.stream_url(),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_BUFFER_BYTES, "1024"),
            (ENV_BOUNDARY, "--myboundary"),
            (ENV_IDLE_TIMEOUT_MS, "0"),
        ]
        .into_iter()
        .collect();

        let mut config = StreamConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.max_buffer_bytes, 1024);
        assert_eq!(config.boundary, "--myboundary");
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = StreamConfig::default();
        config.apply_env(|key| match key {
            ENV_MAX_BUFFER_BYTES => Some("lots".to_string()),
            ENV_CONNECT_TIMEOUT_MS => Some("-5".to_string()),
            _ => None,
        });
        assert_eq!(config, StreamConfig::default());
    }

    #[test]
    fn test_load_dashboard_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "stream": {{ "max_buffer_bytes": 4096 }},
                "cameras": [
                    {{ "id": "porch", "base_url": "http://cam.local", "enabled": true }},
                    {{ "id": "garage", "base_url": "http://cam.local" }}
                ]
            }}"#
        )
        .unwrap();

        let config = DashboardConfig::load(file.path()).unwrap();
        assert_eq!(config.cameras.len(), 2);
        assert!(config.cameras[0].enabled);
        assert!(!config.cameras[1].enabled);
        assert_eq!(config.stream.boundary, DEFAULT_BOUNDARY);
    }

    #[test]
    fn test_load_rejects_bad_camera_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "cameras": [ {{ "id": "x", "base_url": "nope" }} ] }}"#
        )
        .unwrap();
        assert!(matches!(
            DashboardConfig::load(file.path()),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_load_rejects_zero_buffer_ceiling() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "stream": {{ "max_buffer_bytes": 0 }} }}"#).unwrap();
        assert!(matches!(
            DashboardConfig::load(file.path()),
            Err(ConfigError::InvalidSetting {
                field: "max_buffer_bytes",
                ..
            })
        ));
    }
}
