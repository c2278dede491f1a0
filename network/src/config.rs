// SPDX-License-Identifier: MIT OR Apache-2.0

//! Node configuration stored as TOML in the platform config directory

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection_manager::RetryConfig;
use crate::protocols::wire::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the replication listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Where room logs are persisted; the platform data dir when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// How long `close` waits for sessions to say goodbye
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Multiaddr the libp2p swarm listens on
    #[serde(default = "default_swarm_listen")]
    pub swarm_listen: String,
    /// Multiaddrs with a trailing `/p2p/<peer id>`
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
    /// Period of gossip announcements and provider lookups
    #[serde(default = "default_announce_interval", with = "humantime_serde")]
    pub announce_interval: Duration,
    /// First delay after a failed bootstrap, doubled up to `max_bootstrap_backoff`
    #[serde(default = "default_bootstrap_backoff", with = "humantime_serde")]
    pub bootstrap_backoff: Duration,
    #[serde(default = "default_max_bootstrap_backoff", with = "humantime_serde")]
    pub max_bootstrap_backoff: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Entries a peer may send beyond what we hold
    #[serde(default = "default_window")]
    pub window: u64,
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_swarm_listen() -> String {
    "/ip4/0.0.0.0/tcp/0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_announce_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_bootstrap_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_max_bootstrap_backoff() -> Duration {
    Duration::from_secs(120)
}

fn default_window() -> u64 {
    64
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: None,
            shutdown_grace: default_shutdown_grace(),
            discovery: DiscoveryConfig::default(),
            replication: ReplicationConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            swarm_listen: default_swarm_listen(),
            bootstrap_nodes: Vec::new(),
            enable_mdns: true,
            announce_interval: default_announce_interval(),
            bootstrap_backoff: default_bootstrap_backoff(),
            max_bootstrap_backoff: default_max_bootstrap_backoff(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            handshake_timeout: default_handshake_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl NodeConfig {
    /// Configured data dir, or the platform default
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let proj_dirs = project_dirs()?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("io", "peerchat", "peerchat").context("Failed to determine config directory")
}

pub fn get_config_path() -> Result<PathBuf> {
    let proj_dirs = project_dirs()?;
    Ok(proj_dirs.config_dir().join("config.toml"))
}

/// Load the config from the platform location, writing defaults on first run
pub fn load_config() -> Result<NodeConfig> {
    let config_path = get_config_path().context("Failed to determine config path")?;
    load_config_from(&config_path)
}

/// Load the config at `config_path`, writing defaults there if it is missing
pub fn load_config_from(config_path: &Path) -> Result<NodeConfig> {
    if !config_path.exists() {
        tracing::info!("Config file not found, creating default at: {}", config_path.display());

        let default_config = NodeConfig::default();
        save_config_to(&default_config, config_path)?;
        return Ok(default_config);
    }

    let content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

    toml::from_str::<NodeConfig>(&content)
        .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
}

pub fn save_config(config: &NodeConfig) -> Result<()> {
    let config_path = get_config_path().context("Failed to determine config path")?;
    save_config_to(config, &config_path)
}

pub fn save_config_to(config: &NodeConfig, config_path: &Path) -> Result<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let toml_content = toml::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(config_path, toml_content)
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

    tracing::info!("Saved config to: {}", config_path.display());
    Ok(())
}
