use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the on-disk chunk cache.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Root of the persisted container descriptors
    /// (`Active/`, `Deleted/`, `Problematic/`).
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Local read/write directory overlaid on the virtual namespace.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Granularity of cached chunks in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Eviction target upper bound in bytes.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,

    /// Distance from the end of a chunk at which readahead of the next
    /// chunk is scheduled.
    #[serde(default = "default_readahead_trigger")]
    pub readahead_trigger_position: u64,

    /// Global semaphore permit count for concurrent chunk fetches.
    #[serde(default = "default_max_downloads")]
    pub max_total_concurrent_downloads: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Per-HTTP-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Extensions (without the dot, case-insensitive) that cause a
    /// container to be rejected as problematic.
    #[serde(default = "default_blocked_extensions")]
    pub blocked_file_extensions: HashSet<String>,

    #[serde(default = "default_true")]
    pub enable_dormant: bool,

    /// Hours of inactivity after which a downloaded container is
    /// verified, removed upstream and marked dormant.
    #[serde(default = "default_keep_active_hours")]
    pub keep_active_hours: u64,

    /// How many dormant containers are re-verified per dormancy tick.
    #[serde(default = "default_dormant_batch")]
    pub dormant_verification_batch: usize,

    #[serde(default = "default_stall_minutes")]
    pub stall_detection_minutes: u64,

    #[serde(default = "default_stall_speed")]
    pub stall_speed_bytes_per_sec: u64,

    /// Upstream poll interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            debug!("Loading config from {:?}", config_path);
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            info!("Config loaded successfully");
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, contents).context("Failed to write config file")?;

        debug!("Config saved to {:?}", config_path);
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Failed to get config directory")?;
        Ok(config_dir.join("debrid-vfs").join("config.toml"))
    }
}

impl CacheConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl ReconciliationConfig {
    pub fn is_extension_blocked(&self, path: &str) -> bool {
        match path.rsplit_once('.') {
            Some((_, ext)) => self.blocked_file_extensions.contains(&ext.to_lowercase()),
            None => false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            store_root: default_store_root(),
            local_root: default_local_root(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_cache_size: default_max_cache_size(),
            readahead_trigger_position: default_readahead_trigger(),
            max_total_concurrent_downloads: default_max_downloads(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            blocked_file_extensions: default_blocked_extensions(),
            enable_dormant: default_true(),
            keep_active_hours: default_keep_active_hours(),
            dormant_verification_batch: default_dormant_batch(),
            stall_detection_minutes: default_stall_minutes(),
            stall_speed_bytes_per_sec: default_stall_speed(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

fn default_cache_root() -> PathBuf {
    data_dir().join("chunks")
}

fn default_store_root() -> PathBuf {
    data_dir().join("containers")
}

fn default_local_root() -> PathBuf {
    data_dir().join("local")
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("debrid-vfs")
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_cache_size() -> u64 {
    20 * 1024 * 1024 * 1024
}

fn default_readahead_trigger() -> u64 {
    1024 * 1024
}

fn default_max_downloads() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    60
}

fn default_blocked_extensions() -> HashSet<String> {
    ["lnk", "exe", "bat", "cmd", "scr", "iso", "zipx"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_keep_active_hours() -> u64 {
    72
}

fn default_dormant_batch() -> usize {
    5
}

fn default_stall_minutes() -> u64 {
    30
}

fn default_stall_speed() -> u64 {
    64 * 1024
}

fn default_poll_interval() -> u64 {
    30
}
