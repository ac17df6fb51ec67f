//! Configuration structs with defaults and RON persistence.

use std::path::Path;

use portal_blocks::{MAX_XZ_RADIUS, MAX_Y_RADIUS};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Identity and role of this process.
    pub node: NodeConfig,
    /// Where the proxy listens and how links are accepted.
    pub proxy: ProxyConfig,
    /// Request deadlines, keepalive and reconnection.
    pub rpc: RpcConfig,
    /// Remote block polling.
    pub fetch: FetchConfig,
    /// Owner-side change tracking.
    pub tracker: TrackerConfig,
    /// Remote portals this server mirrors.
    pub portals: Vec<PortalConfig>,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Which half of the topology this process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum NodeRole {
    /// Routes requests between servers and owns player sessions.
    Proxy,
    /// Owns worlds and connects to the proxy.
    #[default]
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub role: NodeRole,
    /// Name announced to the proxy. Must be unique across servers.
    pub name: String,
    /// Worlds hosted by this server.
    pub worlds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address servers connect to.
    pub address: String,
    /// Address the proxy binds.
    pub bind_address: String,
    pub handshake_timeout_ms: u64,
    /// Maximum frame payload in bytes.
    pub max_frame_bytes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    /// Deadline for every outbound request.
    pub request_timeout_ms: u64,
    /// How often overdue requests are swept.
    pub sweep_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_multiplier: f64,
    /// Fraction applied as +/- jitter to reconnect delays.
    pub reconnect_jitter: f64,
    /// `None` retries forever.
    pub reconnect_max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Interval between polls of each remote portal.
    pub poll_interval_ms: u64,
    pub xz_radius: u32,
    pub y_radius: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Trackers unused this long are dropped.
    pub idle_timeout_secs: u64,
    pub eviction_interval_secs: u64,
    /// How long a prepared teleport arrival stays valid.
    pub arrival_ttl_secs: u64,
}

/// One mirrored portal: a local opening showing a region of a remote world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortalConfig {
    pub name: String,
    pub local_position: [i32; 3],
    /// Stored direction name, e.g. `"NORTH"` or the legacy `"EAST_WEST"`.
    pub local_direction: String,
    pub destination_server: String,
    pub destination_world: String,
    pub destination_world_id: u64,
    pub destination_position: [i32; 3],
    pub destination_direction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Write a JSON log file next to the config.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Server,
            name: "lobby".to_string(),
            worlds: vec!["overworld".to_string()],
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:25590".to_string(),
            bind_address: "0.0.0.0:25590".to_string(),
            handshake_timeout_ms: 5_000,
            max_frame_bytes: 1_048_576,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            sweep_interval_ms: 500,
            keepalive_interval_ms: 5_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: 0.25,
            reconnect_max_attempts: None,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            xz_radius: 8,
            y_radius: 4,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            eviction_interval_secs: 10,
            arrival_ttl_secs: 30,
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            name: "portal".to_string(),
            local_position: [0, 64, 0],
            local_direction: "NORTH".to_string(),
            destination_server: "survival".to_string(),
            destination_world: "overworld".to_string(),
            destination_world_id: 0,
            destination_position: [0, 64, 0],
            destination_direction: "NORTH".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: true,
        }
    }
}

// --- Validation ---

impl Config {
    /// Rejects values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::Invalid("node.name must not be empty".into()));
        }
        if self.rpc.request_timeout_ms == 0 || self.rpc.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "rpc timeouts and sweep interval must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rpc.reconnect_jitter) {
            return Err(ConfigError::Invalid(format!(
                "rpc.reconnect_jitter {} is outside 0.0..=1.0",
                self.rpc.reconnect_jitter
            )));
        }
        if self.fetch.xz_radius > MAX_XZ_RADIUS || self.fetch.y_radius > MAX_Y_RADIUS {
            return Err(ConfigError::Invalid(format!(
                "fetch radius {}x{} exceeds {MAX_XZ_RADIUS}x{MAX_Y_RADIUS}",
                self.fetch.xz_radius, self.fetch.y_radius
            )));
        }
        if let Some(portal) = self
            .portals
            .iter()
            .find(|p| p.destination_server == self.node.name)
        {
            log::warn!("Portal '{}' points back at this server", portal.name);
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
