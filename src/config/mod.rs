//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub amp: AmpConfig,

    pub hub: HubConfig,

    /// Zone display names exactly as the amplifier design file spells them.
    pub zones: Vec<String>,

    /// Input source names, in selector-index order (index 1 first).
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Amplifier TCP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AmpConfig {
    pub host: String,

    #[serde(default = "default_amp_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Silence on an established connection longer than this tears it down.
    #[serde(default = "default_activity_timeout_ms")]
    pub activity_timeout_ms: u64,
}

impl AmpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_millis(self.activity_timeout_ms)
    }
}

fn default_amp_port() -> u16 {
    10055
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_activity_timeout_ms() -> u64 {
    5000
}

/// Home Assistant websocket endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub host: String,

    #[serde(default = "default_hub_port")]
    pub port: u16,

    /// Long-lived access token presented during the auth handshake.
    pub access_token: String,

    /// Hub user id the bridge's own service calls run as. Events carrying
    /// this id are echoes of our own writes and are dropped.
    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_min_volume")]
    pub min_volume: f64,

    #[serde(default = "default_max_volume")]
    pub max_volume: f64,
}

impl HubConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_hub_port() -> u16 {
    8123
}

fn default_min_volume() -> f64 {
    -60.0
}

fn default_max_volume() -> f64 {
    12.0
}

pub fn load_config() -> Result<Config> {
    let config_dir = directories::ProjectDirs::from("com", "open-horizon-labs", "bose-hass-bridge")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let config = ::config::Config::builder()
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy())
                .required(false),
        )
        // Override with environment variables (BHB_AMP__HOST, BHB_HUB__ACCESS_TOKEN, etc.)
        .add_source(
            ::config::Environment::with_prefix("BHB")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}
