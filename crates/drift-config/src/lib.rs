//! # drift-config
//!
//! Configuration management for drift.
//!
//! Loads configuration from:
//! 1. `~/.drift/config.toml` (global)
//! 2. `./drift.toml` (node-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!(
            "[drift-config] WARNING: Failed to load config: {}. Using defaults.",
            e
        );
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility)
    pub config_version: u32,
    pub node: NodeConfig,
    pub recovery: RecoveryConfig,
    pub rpc: RpcConfig,
    pub lfs: LfsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            node: NodeConfig::default(),
            recovery: RecoveryConfig::default(),
            rpc: RpcConfig::default(),
            lfs: LfsConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations (CWD-relative node config)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_dir(Path::new("."))
    }

    /// Load config for a specific working directory.
    /// Resolution order: global → node file → env vars.
    pub fn load_for_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.drift/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load node config (<dir>/drift.toml)
        let node_config_path = dir.join("drift.toml");
        if node_config_path.exists() {
            debug!("Loading node config from {:?}", node_config_path);
            let contents = std::fs::read_to_string(&node_config_path)?;
            let node_config: Config = toml::from_str(&contents)?;
            config.merge(node_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.drift/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".drift/config.toml"))
    }

    /// Merge another config (node overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let d = Config::default();

        if other.node.host_id != d.node.host_id {
            self.node.host_id = other.node.host_id;
        }
        if other.node.bind != d.node.bind {
            self.node.bind = other.node.bind;
        }
        if !other.node.peers.is_empty() {
            self.node.peers = other.node.peers;
        }
        if other.node.no_timeouts != d.node.no_timeouts {
            self.node.no_timeouts = other.node.no_timeouts;
        }

        if other.recovery != d.recovery {
            self.recovery = other.recovery;
        }
        if other.rpc != d.rpc {
            self.rpc = other.rpc;
        }
        if other.lfs != d.lfs {
            self.lfs = other.lfs;
        }
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("DRIFT_HOST_ID") {
            if let Ok(n) = id.parse() {
                self.node.host_id = n;
            }
        }
        if let Ok(bind) = std::env::var("DRIFT_BIND") {
            self.node.bind = bind;
        }
        if std::env::var("DRIFT_NO_TIMEOUTS").is_ok() {
            self.node.no_timeouts = true;
        }
        if let Ok(secs) = std::env::var("DRIFT_PING_INTERVAL") {
            if let Ok(n) = secs.parse() {
                self.recovery.ping_interval_secs = n;
            }
        }
        if let Ok(secs) = std::env::var("DRIFT_REBOOT_SETTLE") {
            if let Ok(n) = secs.parse() {
                self.recovery.reboot_settle_secs = n;
            }
        }
        if let Ok(n) = std::env::var("DRIFT_NUM_CHANNELS") {
            if let Ok(n) = n.parse() {
                self.rpc.num_channels = n;
            }
        }
        if let Ok(store) = std::env::var("DRIFT_STORE") {
            self.lfs.store = PathBuf::from(store);
        }
    }

    /// Generate TOML template for `drift init`.
    pub fn init_toml() -> String {
        let default = Config::default();
        format!(
            r#"# drift node configuration
config_version = 1

[node]
host_id = {host_id}
bind = "{bind}"
# peers = [{{ id = 2, addr = "10.0.0.2:7715" }}]

[recovery]
# ping_interval_secs = 30
# reboot_settle_secs = 30

[rpc]
# num_channels = 8
# congestion_interval_secs = 10

[lfs]
store = "{store}"
# checkpoint_interval_secs = 60
"#,
            host_id = default.node.host_id,
            bind = default.node.bind,
            store = default.lfs.store.display(),
        )
    }

    // ========== Convenience Accessors ==========

    /// This host's cluster ID
    pub fn host_id(&self) -> u32 {
        self.node.host_id
    }

    /// Resolve a peer's socket address, if configured
    pub fn peer_addr(&self, id: u32) -> Option<&str> {
        self.node
            .peers
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.addr.as_str())
    }

    /// Log store path
    pub fn store_path(&self) -> &Path {
        &self.lfs.store
    }
}

/// Node identity and transport endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// This host's cluster ID (small integer, >= 1)
    pub host_id: u32,
    /// UDP bind address for the transport
    pub bind: String,
    /// Known peers: cluster ID to socket address
    pub peers: Vec<PeerAddr>,
    /// Ignore RPC timeouts when reporting peer death (debugging aid: a
    /// host sitting in a debugger should not be declared crashed)
    pub no_timeouts: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host_id: 1,
            bind: "0.0.0.0:7715".to_string(),
            peers: Vec::new(),
            no_timeouts: false,
        }
    }
}

/// One peer endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerAddr {
    pub id: u32,
    pub addr: String,
    /// Routed peer: use the slower WAN retransmission profile
    #[serde(default)]
    pub wan: bool,
}

/// Peer liveness tracking knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Interval between background pings of a down peer
    pub ping_interval_secs: u64,
    /// Pause after a reboot is detected before running reboot callbacks,
    /// giving the peer time to finish booting
    pub reboot_settle_secs: u64,
    /// Message traffic within this window counts as proof of life,
    /// suppressing probe pings
    pub recent_traffic_secs: u64,
    /// Capacity of the in-memory transition trace ring
    pub trace_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            reboot_settle_secs: 30,
            recent_traffic_secs: 10,
            trace_capacity: 50,
        }
    }
}

impl RecoveryConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
    pub fn reboot_settle(&self) -> Duration {
        Duration::from_secs(self.reboot_settle_secs)
    }
    pub fn recent_traffic(&self) -> Duration {
        Duration::from_secs(self.recent_traffic_secs)
    }
}

/// RPC client transport knobs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    /// Size of the client channel pool
    pub num_channels: usize,
    /// How long a NACK keeps a server restricted to one channel
    pub congestion_interval_secs: u64,
    /// Attempts against a congested server before giving up
    pub nack_retry_cap: u32,
    /// Timeout escalation profile for same-segment (LAN) routes
    pub lan: RouteProfile,
    /// Timeout escalation profile for routed (WAN) peers
    pub wan: RouteProfile,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            num_channels: 8,
            congestion_interval_secs: 10,
            nack_retry_cap: 3,
            lan: RouteProfile {
                initial_timeout_ms: 100,
                max_timeout_ms: 800,
                max_retries: 5,
            },
            wan: RouteProfile {
                initial_timeout_ms: 500,
                max_timeout_ms: 4000,
                max_retries: 5,
            },
        }
    }
}

impl RpcConfig {
    pub fn congestion_interval(&self) -> Duration {
        Duration::from_secs(self.congestion_interval_secs)
    }
}

/// Per-route retransmission constants. The timeout doubles on every retry
/// until it hits the cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouteProfile {
    pub initial_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for RouteProfile {
    fn default() -> Self {
        Self {
            initial_timeout_ms: 100,
            max_timeout_ms: 800,
            max_retries: 5,
        }
    }
}

impl RouteProfile {
    pub fn initial_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_timeout_ms)
    }
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

/// Log-structured store knobs. Geometry is fixed at format time; the
/// values here seed `drift fmt` and tune the running system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LfsConfig {
    /// Store path
    pub store: PathBuf,
    /// Segments in a newly formatted store
    pub segment_count: u32,
    /// Segment size in bytes for a newly formatted store
    pub segment_size: u32,
    /// Block size in bytes for a newly formatted store
    pub block_size: u32,
    /// Dirty threshold as a percentage of segment size
    pub dirty_threshold_pct: u32,
    /// Cleaner skips dirty segments at or below this many live bytes;
    /// zero takes everything on the dirty list
    pub clean_range_low: u32,
    /// Seconds between periodic checkpoints
    pub checkpoint_interval_secs: u64,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from("/var/lib/drift/store.lfs"),
            segment_count: 128,
            segment_size: 512 * 1024,
            block_size: 4096,
            dirty_threshold_pct: 10,
            clean_range_low: 0,
            checkpoint_interval_secs: 60,
        }
    }
}

impl LfsConfig {
    /// Dirty threshold in bytes for the configured geometry
    pub fn dirty_threshold(&self) -> u32 {
        self.segment_size / 100 * self.dirty_threshold_pct
    }
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}
