//! Configuration management
//!
//! Settings are read from a TOML file. A missing file yields the defaults;
//! a present but malformed file is an error.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::ConfigError;

const CONFIG_FILE: &str = "zonecast.toml";

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub streaming: StreamingConfig,
    pub ui: UiConfig,
}

/// Identity of this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name; also the transport member name
    pub name: String,
    /// JSON catalog produced by the tag scanner
    pub catalog: Option<PathBuf>,
    /// Member names containing this marker are treated as mobile clients
    pub mobile_marker: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "zonecast".to_string(),
            catalog: None,
            mobile_marker: DEFAULT_MOBILE_MARKER.to_string(),
        }
    }
}

/// Group transport and streaming network settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Multicast group carrying heartbeats and group broadcasts
    pub group_address: Ipv4Addr,
    pub group_port: u16,
    /// UDP port of the remote-control datagram protocol
    pub external_port: u16,
    /// Port every audio stream is sent to
    pub stream_port: u16,
    /// First candidate when scanning for a free stream address
    pub starting_multicast_address: Ipv4Addr,
    pub listen_window_ms: u64,
    pub max_scan_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// A member silent for longer than this drops out of the view
    pub member_timeout_ms: u64,
    pub multicast_ttl: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            group_address: DEFAULT_GROUP_ADDRESS.parse().unwrap_or(Ipv4Addr::new(239, 255, 42, 99)),
            group_port: DEFAULT_GROUP_PORT,
            external_port: DEFAULT_EXTERNAL_PORT,
            stream_port: DEFAULT_STREAM_PORT,
            starting_multicast_address: STARTING_MCAST_ADDRESS.parse().unwrap_or(Ipv4Addr::new(226, 0, 0, 0)),
            listen_window_ms: DEFAULT_LISTEN_WINDOW_MS,
            max_scan_attempts: DEFAULT_MAX_SCAN_ATTEMPTS,
            heartbeat_interval_ms: 1_000,
            member_timeout_ms: 3_500,
            multicast_ttl: 1,
        }
    }
}

/// Session pool and playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub max_sessions: usize,
    /// How long a publisher waits for receiver acknowledgments
    pub ack_timeout_ms: u64,
    /// Pause between removing a finished track and tearing its session down
    pub next_settle_ms: u64,
    /// Payload bytes per stream packet
    pub frame_bytes: usize,
    /// Nominal bitrate used to pace chunked sources
    pub bitrate_kbps: u32,
    /// Where receivers write the stream; `None` discards it
    pub output: Option<PathBuf>,
    /// Receiver reordering window, in packets (power of two)
    pub jitter_capacity: usize,
    /// Packets buffered before playback starts
    pub jitter_delay: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            next_settle_ms: DEFAULT_NEXT_SETTLE_MS,
            frame_bytes: 1_024,
            bitrate_kbps: 320,
            output: None,
            jitter_capacity: 64,
            jitter_delay: 4,
        }
    }
}

/// Local control channel server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_UI_PORT,
        }
    }
}

impl AppConfig {
    /// Platform config location, e.g. `~/.config/zonecast/zonecast.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "zonecast", "zonecast").map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let streaming = &self.streaming;
        if streaming.max_sessions == 0 || streaming.max_sessions > MAX_SESSIONS_CEILING {
            return Err(ConfigError::Invalid {
                field: "streaming.max_sessions",
                reason: format!("must be between 1 and {}", MAX_SESSIONS_CEILING),
            });
        }
        if streaming.frame_bytes == 0 || streaming.frame_bytes > MAX_PACKET_SIZE - crate::network::packet::HEADER_SIZE {
            return Err(ConfigError::Invalid {
                field: "streaming.frame_bytes",
                reason: format!(
                    "must fit in one packet ({} bytes max)",
                    MAX_PACKET_SIZE - crate::network::packet::HEADER_SIZE
                ),
            });
        }
        if streaming.bitrate_kbps == 0 {
            return Err(ConfigError::Invalid {
                field: "streaming.bitrate_kbps",
                reason: "must be positive".to_string(),
            });
        }
        if !streaming.jitter_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "streaming.jitter_capacity",
                reason: "must be a power of two".to_string(),
            });
        }
        if !self.network.group_address.is_multicast() {
            return Err(ConfigError::Invalid {
                field: "network.group_address",
                reason: format!("{} is not a multicast address", self.network.group_address),
            });
        }
        if !self.network.starting_multicast_address.is_multicast() {
            return Err(ConfigError::Invalid {
                field: "network.starting_multicast_address",
                reason: format!("{} is not a multicast address", self.network.starting_multicast_address),
            });
        }
        if self.network.member_timeout_ms <= self.network.heartbeat_interval_ms {
            return Err(ConfigError::Invalid {
                field: "network.member_timeout_ms",
                reason: "must exceed the heartbeat interval".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.streaming.max_sessions, 6);
        assert_eq!(config.network.stream_port, 5005);
        assert_eq!(config.network.starting_multicast_address, Ipv4Addr::new(226, 0, 0, 0));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zonecast.toml");
        std::fs::write(&path, "[node]\nname = \"kitchen\"\n\n[streaming]\nmax_sessions = 10\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.node.name, "kitchen");
        assert_eq!(config.streaming.max_sessions, 10);
        assert_eq!(config.streaming.ack_timeout_ms, DEFAULT_ACK_TIMEOUT_MS);
        assert_eq!(config.ui.http_port, DEFAULT_UI_PORT);
    }

    #[test]
    fn test_rejects_pool_above_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zonecast.toml");
        std::fs::write(&path, "[streaming]\nmax_sessions = 11\n").unwrap();

        match AppConfig::load(&path) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "streaming.max_sessions"),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("zonecast.toml");
        let mut config = AppConfig::default();
        config.node.catalog = Some(PathBuf::from("/music/catalog.json"));
        config.streaming.output = Some(PathBuf::from("/tmp/zonecast.pcm"));

        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zonecast.toml");
        std::fs::write(&path, "[streaming\nmax_sessions = ").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
