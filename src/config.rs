//! Application configuration
//!
//! TOML-backed settings for both binaries. Every field falls back to the
//! crate constants, so a missing file or missing keys still produce a
//! working link.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_ALARM_THRESHOLD, DEFAULT_ALARM_TRIGGER_PERIOD,
    DEFAULT_NOTIFICATION_THRESHOLD, DISCOVERY_PORT, MULTICAST_GROUP, QUIET_INTERVAL, STREAM_PORT,
};
use crate::error::{Error, Result};

/// Network endpoints and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Where discovery PINGs are sent; the broadcast address by default,
    /// a unicast address for directed discovery
    pub discovery_addr: Ipv4Addr,
    pub discovery_port: u16,
    pub stream_port: u16,
    /// Multicast group the stream subscriber joins; `None` keeps the
    /// subscriber unicast
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multicast_group: Option<Ipv4Addr>,
    pub connect_timeout: Duration,
    pub quiet_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_addr: Ipv4Addr::BROADCAST,
            discovery_port: DISCOVERY_PORT,
            stream_port: STREAM_PORT,
            multicast_group: Some(MULTICAST_GROUP),
            connect_timeout: CONNECT_TIMEOUT,
            quiet_interval: QUIET_INTERVAL,
        }
    }
}

impl NetworkConfig {
    /// Full discovery destination address
    pub fn discovery_target(&self) -> SocketAddr {
        SocketAddr::new(self.discovery_addr.into(), self.discovery_port)
    }

    /// Full multicast stream destination address
    pub fn stream_target(&self) -> SocketAddr {
        let group = self.multicast_group.unwrap_or(MULTICAST_GROUP);
        SocketAddr::new(group.into(), self.stream_port)
    }
}

/// Loudness classification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub notification_threshold: i32,
    pub alarm_threshold: i32,
    pub alarm_trigger_period: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            notification_threshold: DEFAULT_NOTIFICATION_THRESHOLD,
            alarm_threshold: DEFAULT_ALARM_THRESHOLD,
            alarm_trigger_period: DEFAULT_ALARM_TRIGGER_PERIOD,
        }
    }
}

/// Top-level configuration for both binaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub analyzer: AnalyzerConfig,
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "babymon")
            .map(|dirs| dirs.config_dir().join("babymon.toml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file is absent
    pub fn load_or_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => match Self::load_from(&path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to load {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_constants() {
        let config = AppConfig::default();
        assert_eq!(config.network.discovery_port, 2011);
        assert_eq!(config.network.stream_port, 2012);
        assert_eq!(
            config.network.multicast_group,
            Some(Ipv4Addr::new(239, 51, 67, 81))
        );
        assert_eq!(config.analyzer.notification_threshold, 30);
        assert_eq!(config.analyzer.alarm_threshold, 60);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = AppConfig::default();
        config.analyzer.alarm_threshold = 75;
        config.network.discovery_addr = Ipv4Addr::LOCALHOST;

        let raw = toml::to_string_pretty(&config).unwrap();
        let back: AppConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.analyzer.alarm_threshold, 75);
        assert_eq!(back.network.discovery_addr, Ipv4Addr::LOCALHOST);
        assert_eq!(back.network.connect_timeout, CONNECT_TIMEOUT);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.network.discovery_port, 2011);
        assert_eq!(config.analyzer.alarm_threshold, 60);
    }
}
