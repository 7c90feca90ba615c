//! Call engine configuration

use crate::types::IceServer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for [`CallConfig`]
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Call engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// STUN servers used for ICE
    pub ice_servers: Vec<IceServer>,
    /// Seconds the caller rings before giving up
    pub ring_timeout_secs: u64,
    /// Remote candidates held while the remote description is missing
    pub max_buffered_candidates: usize,
    /// Capacity of the call event broadcast channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            ring_timeout_secs: 30,
            max_buffered_candidates: 256,
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Parse and validate a JSON config
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or fails validation
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        let config = config.normalized();
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is invalid
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), ice_servers = config.ice_servers.len(), "Config loaded");
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "ring_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_buffered_candidates == 0 {
            return Err(ConfigError::Invalid(
                "max_buffered_candidates must be greater than 0".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be greater than 0".to_string(),
            ));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.trim().is_empty()) {
                return Err(ConfigError::Invalid("empty ICE server URL".to_string()));
            }
        }
        Ok(())
    }

    /// Replace the ICE servers with STUN URLs, adding the scheme where missing
    #[must_use]
    pub fn with_stun_servers<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ice_servers = urls.into_iter().map(IceServer::stun).collect();
        self.normalized()
    }

    /// Ringing timeout as a [`Duration`]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    fn normalized(mut self) -> Self {
        for server in &mut self.ice_servers {
            for url in &mut server.urls {
                let trimmed = url.trim();
                if !trimmed.is_empty() && !has_ice_scheme(trimmed) {
                    *url = format!("stun:{trimmed}");
                }
            }
        }
        self
    }
}

fn has_ice_scheme(url: &str) -> bool {
    ["stun:", "stuns:", "turn:", "turns:"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_timeout(), Duration::from_secs(30));
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CallConfig::from_json(r#"{"ring_timeout_secs": 5}"#).unwrap();
        assert_eq!(config.ring_timeout_secs, 5);
        assert_eq!(config.max_buffered_candidates, 256);
    }

    #[test]
    fn test_scheme_added_to_bare_urls() {
        let config = CallConfig::from_json(
            r#"{"ice_servers": [{"urls": ["stun.example.org:3478", "turn:relay.example.org"]}]}"#,
        )
        .unwrap();
        assert_eq!(
            config.ice_servers[0].urls,
            vec![
                "stun:stun.example.org:3478".to_string(),
                "turn:relay.example.org".to_string()
            ]
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = CallConfig::from_json(r#"{"ring_timeout_secs": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_url_rejected() {
        let err = CallConfig::from_json(r#"{"ice_servers": [{"urls": [" "]}]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_buffered_candidates": 8, "event_capacity": 4}}"#).unwrap();
        let config = CallConfig::load(file.path()).unwrap();
        assert_eq!(config.max_buffered_candidates, 8);
        assert_eq!(config.event_capacity, 4);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CallConfig::load(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_with_stun_servers() {
        let config = CallConfig::default().with_stun_servers(["stun.local:3478"]);
        assert_eq!(config.ice_servers, vec![IceServer::stun("stun:stun.local:3478")]);
    }
}
