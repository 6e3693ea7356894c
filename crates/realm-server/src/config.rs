//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (REALM_HOST, REALM_PORT, REALM_CONFIG)
//! - TOML configuration file (`realm.toml`)

use anyhow::{Context, Result};
use realm_core::{ExecutorConfig, HubConfig};
use realm_protocol::{WorldId, WorldKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What this process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Link hub bridging world processes.
    Hub,
    /// A world hosting players.
    World,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Process role.
    #[serde(default = "default_role")]
    pub role: Role,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for player connections (world) or world links (hub).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Port of the HTTP status endpoints.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Executor lanes.
    #[serde(default)]
    pub executor: ExecutorSection,

    /// Link between worlds and the hub.
    #[serde(default)]
    pub link: LinkConfig,

    /// World settings, used by the world role.
    #[serde(default)]
    pub world: WorldConfig,

    /// Pool sizes.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Background sweep periods.
    #[serde(default)]
    pub sweeps: SweepConfig,

    /// Player store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Background services to install, by id.
    #[serde(default = "default_services")]
    pub services: Vec<String>,
}

/// Executor lane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Simulation pulse in milliseconds.
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,

    /// Parallel lane size as a multiple of available cores.
    #[serde(default = "default_parallel_multiplier")]
    pub parallel_multiplier: f64,

    #[serde(default = "default_two")]
    pub service_threads: usize,

    #[serde(default = "default_two")]
    pub world_threads: usize,

    #[serde(default = "default_two")]
    pub map_threads: usize,

    #[serde(default = "default_one")]
    pub cache_threads: usize,

    #[serde(default = "default_two")]
    pub link_threads: usize,
}

/// Link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Hub address worlds connect to.
    #[serde(default = "default_hub_addr")]
    pub hub_addr: String,

    /// Shared key worlds authenticate with.
    #[serde(default = "default_link_key")]
    pub key: String,

    /// Link connections each world opens.
    #[serde(default = "default_one")]
    pub transports: usize,

    /// Transports the hub accepts per world.
    #[serde(default = "default_max_transports")]
    pub max_transports_per_world: usize,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Delay before reconnecting a dropped link, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// How long the hub waits for a roster answer, in milliseconds.
    #[serde(default = "default_roster_timeout")]
    pub roster_timeout_ms: u64,

    /// Frames queued per connection before sends fail.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

/// World configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    #[serde(default = "default_world_id")]
    pub id: WorldId,

    #[serde(default = "default_world_kind")]
    pub kind: WorldKind,

    /// Address advertised to the hub.
    #[serde(default)]
    pub address: Option<String>,

    #[serde(default = "default_max_players")]
    pub max_players: usize,

    /// Players idle longer than this are disconnected, in milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Roster clients the hub sweep may use at once.
    #[serde(default = "default_one")]
    pub roster_clients: usize,

    /// Concurrent player saves.
    #[serde(default = "default_store_sessions")]
    pub store_sessions: usize,

    /// Longest wait for a pooled handle, in milliseconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

/// Sweep periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_roster_interval")]
    pub roster_interval_ms: u64,

    #[serde(default = "default_persistence_interval")]
    pub persistence_interval_ms: u64,

    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_ms: u64,
}

/// Player store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding one JSON file per player.
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_role() -> Role {
    Role::World
}

fn default_host() -> String {
    std::env::var("REALM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("REALM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(43594)
}

fn default_http_port() -> u16 {
    8080
}

fn default_pulse_ms() -> u64 {
    600
}

fn default_parallel_multiplier() -> f64 {
    1.0
}

fn default_one() -> usize {
    1
}

fn default_two() -> usize {
    2
}

fn default_hub_addr() -> String {
    "127.0.0.1:43590".to_string()
}

fn default_link_key() -> String {
    "change-me".to_string()
}

fn default_max_transports() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_reconnect_delay() -> u64 {
    3_000
}

fn default_roster_timeout() -> u64 {
    2_000
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_world_id() -> WorldId {
    1
}

fn default_world_kind() -> WorldKind {
    WorldKind::GameAndLobby
}

fn default_max_players() -> usize {
    2_000
}

fn default_idle_timeout() -> u64 {
    60_000
}

fn default_store_sessions() -> usize {
    4
}

fn default_acquire_timeout() -> u64 {
    5_000
}

fn default_roster_interval() -> u64 {
    30_000
}

fn default_persistence_interval() -> u64 {
    300_000
}

fn default_idle_check_interval() -> u64 {
    5_000
}

fn default_store_dir() -> String {
    "~/.local/share/realm/players".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_services() -> Vec<String> {
    vec!["lane-stats".to_string(), "tick-prune".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            host: default_host(),
            port: default_port(),
            http_port: default_http_port(),
            executor: ExecutorSection::default(),
            link: LinkConfig::default(),
            world: WorldConfig::default(),
            pool: PoolConfig::default(),
            sweeps: SweepConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
            services: default_services(),
        }
    }
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            pulse_ms: default_pulse_ms(),
            parallel_multiplier: default_parallel_multiplier(),
            service_threads: 2,
            world_threads: 2,
            map_threads: 2,
            cache_threads: 1,
            link_threads: 2,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            hub_addr: default_hub_addr(),
            key: default_link_key(),
            transports: 1,
            max_transports_per_world: default_max_transports(),
            connect_timeout_ms: default_connect_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            roster_timeout_ms: default_roster_timeout(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            id: default_world_id(),
            kind: default_world_kind(),
            address: None,
            max_players: default_max_players(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            roster_clients: 1,
            store_sessions: default_store_sessions(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            roster_interval_ms: default_roster_interval(),
            persistence_interval_ms: default_persistence_interval(),
            idle_check_interval_ms: default_idle_check_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `REALM_CONFIG`, the default paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("REALM_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "realm.toml",
            "/etc/realm/realm.toml",
            "~/.config/realm/realm.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Socket address for the main listener.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Socket address for the HTTP endpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.http_port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.http_port))
    }

    /// Hub address worlds connect to.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not parse.
    pub fn hub_addr(&self) -> Result<SocketAddr> {
        self.link
            .hub_addr
            .parse()
            .with_context(|| format!("Invalid hub address {}", self.link.hub_addr))
    }

    /// Address this world advertises to the hub.
    #[must_use]
    pub fn advertised_address(&self) -> String {
        self.world
            .address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }

    /// Player store directory with `~` and variables expanded.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced variable is undefined.
    pub fn store_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.store.dir)
            .with_context(|| format!("Failed to expand store dir {}", self.store.dir))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }

    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            pulse: Duration::from_millis(self.executor.pulse_ms.max(1)),
            parallel_multiplier: self.executor.parallel_multiplier,
            service_threads: self.executor.service_threads,
            world_threads: self.executor.world_threads,
            map_threads: self.executor.map_threads,
            cache_threads: self.executor.cache_threads,
            link_threads: self.executor.link_threads,
        }
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_transports_per_world: self.link.max_transports_per_world,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.role, Role::World);
        assert_eq!(config.executor.pulse_ms, 600);
        assert_eq!(config.world.kind, WorldKind::GameAndLobby);
        assert_eq!(config.services, vec!["lane-stats", "tick-prune"]);
    }

    #[test]
    fn test_config_http_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            ..Config::default()
        };
        assert_eq!(config.http_addr().unwrap().port(), 8080);
        assert!(Config {
            host: "not a host".to_string(),
            ..Config::default()
        }
        .bind_addr()
        .is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            role = "hub"
            host = "0.0.0.0"
            port = 43590
            services = ["lane-stats"]

            [executor]
            pulse_ms = 300

            [world]
            id = 7
            kind = "lobby"

            [link]
            key = "s3cret"
            transports = 3
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.role, Role::Hub);
        assert_eq!(config.port, 43590);
        assert_eq!(config.executor.pulse_ms, 300);
        assert_eq!(config.executor.world_threads, 2);
        assert_eq!(config.world.id, 7);
        assert_eq!(config.world.kind, WorldKind::Lobby);
        assert_eq!(config.link.key, "s3cret");
        assert_eq!(config.link.transports, 3);
        assert_eq!(config.link.connect_timeout_ms, 5_000);
        assert_eq!(config.executor_config().pulse, Duration::from_millis(300));
    }

    #[test]
    fn test_advertised_address_defaults_to_bind() {
        let config = Config {
            host: "10.0.0.5".to_string(),
            port: 43595,
            ..Config::default()
        };
        assert_eq!(config.advertised_address(), "10.0.0.5:43595");
    }
}
