use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/chronod/chronod.toml";
const ENV_CONFIG_PATH: &str = "CHRONOD_CONFIG";

/// How aggressively the storage layer calls fsync.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    /// fsync on every flush.
    Max,
    /// fsync on every 8th flush.
    #[default]
    Balanced,
    /// fsync on every 32nd flush.
    Throughput,
}

impl Durability {
    /// Number of flushes between fsyncs.
    pub fn sync_interval(&self) -> u32 {
        match self {
            Durability::Max => 1,
            Durability::Balanced => 8,
            Durability::Throughput => 32,
        }
    }
}

/// What a producer does when its slot pool is exhausted.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffPolicy {
    /// Yield and retry until a slot frees up.
    #[default]
    LinearBackoff,
    /// Sleep 1 ms and drop the sample.
    Throttle,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `CHRONOD_CONFIG` environment variable. A missing or unparseable
    /// file yields the defaults.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(PathBuf::from(path))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        match fs::read_to_string(path.as_ref()) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding the volume files, the meta volume and the catalog.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Number of volumes in the ring.
    #[serde(default = "default_nvolumes")]
    pub nvolumes: u32,
    /// Volume capacity in 4 KiB blocks.
    #[serde(default = "default_volume_capacity")]
    pub volume_capacity: u32,
    /// Sequencer sliding window in nanoseconds. Must be >= 2.
    #[serde(default = "default_window_size")]
    pub window_size: u64,
    /// Minimum number of buffered samples before a checkpoint materializes.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Soft cap on sequencer memory, bytes.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    #[serde(default)]
    pub durability: Durability,
    /// Request huge pages for volume mappings.
    #[serde(default)]
    pub enable_huge_tlb: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            nvolumes: default_nvolumes(),
            volume_capacity: default_volume_capacity(),
            window_size: default_window_size(),
            compression_threshold: default_compression_threshold(),
            max_cache_size: default_max_cache_size(),
            durability: Durability::default(),
            enable_huge_tlb: false,
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/chronod")
}
fn default_nvolumes() -> u32 {
    4
}
fn default_volume_capacity() -> u32 {
    // 4 GiB per volume
    1024 * 1024
}
fn default_window_size() -> u64 {
    // 10 seconds
    10_000_000_000
}
fn default_compression_threshold() -> usize {
    1000
}
fn default_max_cache_size() -> u64 {
    128 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Number of SPSC queues between sessions and the writer.
    #[serde(default = "default_nqueues")]
    pub nqueues: usize,
    #[serde(default)]
    pub backoff_policy: BackoffPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            nqueues: default_nqueues(),
            backoff_policy: BackoffPolicy::default(),
        }
    }
}

fn default_nqueues() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// TCP port speaking the RESP-like dialect.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// TCP port speaking the line-oriented "put" dialect.
    #[serde(default = "default_line_port")]
    pub line_port: u16,
    /// UDP port (RESP-like dialect, one record group per datagram).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// UDP worker count.
    #[serde(default = "default_nworkers")]
    pub nworkers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
            line_port: default_line_port(),
            udp_port: default_udp_port(),
            nworkers: default_nworkers(),
        }
    }
}

fn default_tcp_port() -> u16 {
    8282
}
fn default_line_port() -> u16 {
    8283
}
fn default_udp_port() -> u16 {
    8383
}
fn default_nworkers() -> usize {
    1
}
