//! Client configuration: one struct per concern, composed into a top-level
//! `ClientConfig`, TOML round-trippable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{HiveError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub allow_self_signed: bool,
    pub useragent: String,
    #[serde(with = "humantime_secs")]
    pub initial_retry: Duration,
    #[serde(with = "humantime_secs")]
    pub max_retry: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5678,
            use_tls: true,
            allow_self_signed: true,
            useragent: "HiveMindBusClientV0.0.1".to_string(),
            initial_retry: Duration::from_secs(5),
            max_retry: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolSettings {
    pub share_bus: bool,
    #[serde(with = "humantime_secs")]
    pub handshake_deadline: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            share_bus: false,
            handshake_deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
    pub enable_console: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_console: true,
        }
    }
}

/// Top-level client configuration; composes the per-concern settings above.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClientConfig {
    pub transport: TransportSettings,
    pub protocol: ProtocolSettings,
    pub logging: LoggingSettings,
    /// Access key granted by the hive's master; required to connect.
    pub access_key: String,
    /// Optional shared password; when present the session key is derived
    /// from it instead of a runtime-supplied key (see `crypto::SessionKey`).
    pub password: Option<String>,
}

impl ClientConfig {
    pub fn new(access_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_file(&self, path: &PathBuf) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| HiveError::ConfigError("no platform config directory".into()))?;
        Ok(base.join("hivemind").join("client.toml"))
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_sane_transport_settings() {
        let config = ClientConfig::default();
        assert_eq!(config.transport.port, 5678);
        assert!(config.transport.use_tls);
    }

    #[test]
    fn roundtrips_through_toml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.toml");

        let config = ClientConfig::new("my-access-key");
        config.to_file(&path).unwrap();

        let loaded = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }
}
