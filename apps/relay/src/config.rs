//! Relay configuration.
//!
//! Stored as TOML at `$TOASTY_RELAY_CONFIG` if set, otherwise:
//! - Linux: `~/.config/toasty/relay.toml`
//! - Windows: `%APPDATA%/toasty/relay.toml`

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use toasty_protocol::constants::DEFAULT_RELAY_PORT;
use toasty_relay_server::ServerConfig;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "TOASTY_RELAY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds a room may live before the sweeper drops it.
    #[serde(default = "default_room_ttl_secs")]
    pub room_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Upper bound on live rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_RELAY_PORT
}

fn default_room_ttl_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_max_rooms() -> usize {
    10_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            room_ttl_secs: default_room_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_rooms: default_max_rooms(),
        }
    }
}

impl RelayConfig {
    /// Loads configuration from the default location, creating it if missing.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    /// Loads configuration from `path`, writing the defaults there first if
    /// the file does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: RelayConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = RelayConfig::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
            room_ttl: Duration::from_secs(self.room_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            max_rooms: self.max_rooms,
        }
    }
}

/// Returns the configuration file path.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("toasty").join("relay.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("toasty")
            .join("relay.toml")
    }
}
