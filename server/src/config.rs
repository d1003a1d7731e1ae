//! Server configuration.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use derivative::Derivative;
use serde::Deserialize;
use xdg::BaseDirectories;

use crate::narinfo::Compression as NixCompression;
use crate::storage::LocalStorageConfig;

/// Application prefix in XDG base directories.
const XDG_PREFIX: &str = "pullcache";

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// Useful for deploying to platforms that only let you set environment
/// variables (e.g. Fly.io).
const ENV_CONFIG_BASE64: &str = "PULLCACHE_SERVER_CONFIG_BASE64";

/// Environment variable storing the database connection string.
const ENV_DATABASE_URL: &str = "PULLCACHE_SERVER_DATABASE_URL";

/// Environment variable storing the lock service's Redis connection string.
const ENV_LOCK_URL: &str = "PULLCACHE_SERVER_LOCK_URL";

/// Configuration for the pull-through cache coordination engine.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Allowed `Host` headers.
    ///
    /// If unconfigured or empty, all `Host` headers are allowed.
    #[serde(rename = "allowed-hosts")]
    #[serde(default = "Vec::new")]
    pub allowed_hosts: Vec<String>,

    /// Cache identity used in signatures and URLs.
    ///
    /// Must have no scheme or path (e.g. `cache.example.com`).
    pub hostname: String,

    /// Path to the Ed25519 signing key.
    ///
    /// If the file does not exist, a keypair is generated and stored here.
    #[serde(rename = "secret-key-path")]
    pub secret_key_path: PathBuf,

    /// LRU high-water mark, in bytes.
    ///
    /// Zero disables the size cap (the evictor never runs).
    #[serde(rename = "max-size")]
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Database connection.
    pub database: DatabaseConfig,

    /// File and chunk storage.
    pub storage: StorageConfig,

    /// Distributed locking (C1).
    #[serde(default = "Default::default")]
    pub lock: LockConfig,

    /// Upstream binary caches, tried in order.
    pub upstreams: Vec<UpstreamConfig>,

    /// Content-defined chunking.
    #[serde(default = "Default::default")]
    pub chunking: ChunkingConfig,

    /// Compression applied to NARs and chunks stored locally.
    #[serde(default = "Default::default")]
    pub compression: CompressionConfig,

    /// Whether to strip upstream signatures and re-sign info records with
    /// our own key before serving them to clients.
    #[serde(rename = "cache-sign-info-record")]
    #[serde(default = "default_cache_sign_info_record")]
    pub cache_sign_info_record: bool,

    /// Debounce window for `last_accessed_at` updates.
    ///
    /// A `GetInfoRecord` hit only touches the row if the previous touch is
    /// older than this, to avoid writing on every cache hit.
    #[serde(rename = "record-age-ignore-touch")]
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_record_age_ignore_touch")]
    pub record_age_ignore_touch: Duration,

    /// How long a caller waits for an in-flight fetch owned by another
    /// process before giving up.
    #[serde(rename = "download-poll-timeout")]
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_download_poll_timeout")]
    pub download_poll_timeout: Duration,

    /// LRU eviction.
    #[serde(rename = "eviction")]
    #[serde(default = "Default::default")]
    pub eviction: EvictionConfig,

    /// Logging.
    #[serde(default = "Default::default")]
    pub log: LogConfig,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL.
    #[serde(default = "load_database_url_from_env")]
    pub url: String,

    /// Whether to enable sending of periodic heartbeat queries.
    #[serde(default = "default_db_heartbeat")]
    pub heartbeat: bool,
}

/// File storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Local file storage.
    #[serde(rename = "local")]
    Local(LocalStorageConfig),
}

/// Distributed lock service configuration (C1).
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Redis connection URL.
    #[serde(default = "load_lock_url_from_env")]
    pub url: String,

    /// TTL of a lock held while fetching a single NAR (or chunk run).
    #[serde(rename = "download-lock-ttl")]
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_download_lock_ttl")]
    pub download_lock_ttl: Duration,

    /// TTL of a lock held for longer-lived maintenance operations
    /// (CDC migration, eviction).
    #[serde(rename = "cache-lock-ttl")]
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_cache_lock_ttl")]
    pub cache_lock_ttl: Duration,

    /// Retry policy used while attempting to acquire a lock.
    #[serde(rename = "retry")]
    #[serde(default = "Default::default")]
    pub retry: LockRetryConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            url: load_lock_url_from_env(),
            download_lock_ttl: default_download_lock_ttl(),
            cache_lock_ttl: default_cache_lock_ttl(),
            retry: LockRetryConfig::default(),
        }
    }
}

/// Lock acquisition retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct LockRetryConfig {
    /// Maximum number of acquisition attempts before giving up.
    #[serde(rename = "max-attempts")]
    #[serde(default = "default_lock_retry_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(rename = "initial-delay")]
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_lock_retry_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on the backoff delay.
    #[serde(rename = "max-delay")]
    #[serde(with = "humantime_serde")]
    #[serde(default = "default_lock_retry_max_delay")]
    pub max_delay: Duration,

    /// Fraction of jitter applied to each backoff delay, in `[0, 1]`.
    #[serde(default = "default_lock_retry_jitter")]
    pub jitter: f64,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_lock_retry_max_attempts(),
            initial_delay: default_lock_retry_initial_delay(),
            max_delay: default_lock_retry_max_delay(),
            jitter: default_lock_retry_jitter(),
        }
    }
}

/// A single upstream binary cache.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream cache (e.g. `https://cache.nixos.org`).
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Public keys accepted when verifying this upstream's signatures.
    ///
    /// An info record with no matching signature is rejected.
    #[serde(rename = "public-keys")]
    #[serde(default = "Vec::new")]
    pub public_keys: Vec<String>,
}

/// Data chunking (C7).
///
/// Changing these values after NARs have already been chunked will not
/// reuse existing chunks for re-fetched content, since the cutpoints
/// differ; deduplication suffers for a while after a change.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    /// Whether content-defined chunking is used at all.
    ///
    /// If disabled, NARs are always stored and served as a single object.
    #[serde(rename = "enabled")]
    #[serde(default = "default_cdc_enabled")]
    pub cdc_enabled: bool,

    /// The minimum NAR size to trigger chunking.
    #[serde(rename = "nar-size-threshold")]
    #[serde(default = "default_cdc_nar_size_threshold")]
    pub nar_size_threshold: usize,

    /// The preferred minimum size of a chunk, in bytes.
    #[serde(rename = "min-size")]
    #[serde(default = "default_cdc_min_chunk_size")]
    pub cdc_min_chunk_size: usize,

    /// The preferred average size of a chunk, in bytes.
    #[serde(rename = "avg-size")]
    #[serde(default = "default_cdc_avg_chunk_size")]
    pub cdc_avg_chunk_size: usize,

    /// The preferred maximum size of a chunk, in bytes.
    #[serde(rename = "max-size")]
    #[serde(default = "default_cdc_max_chunk_size")]
    pub cdc_max_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            cdc_enabled: default_cdc_enabled(),
            nar_size_threshold: default_cdc_nar_size_threshold(),
            cdc_min_chunk_size: default_cdc_min_chunk_size(),
            cdc_avg_chunk_size: default_cdc_avg_chunk_size(),
            cdc_max_chunk_size: default_cdc_max_chunk_size(),
        }
    }
}

/// Compression applied to content stored locally.
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Compression type.
    pub r#type: CompressionType,

    /// Compression level. If unspecified, a sane default is chosen.
    pub level: Option<i32>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            r#type: CompressionType::Zstd,
            level: None,
        }
    }
}

/// Compression type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CompressionType {
    /// No compression.
    #[serde(rename = "none")]
    None,

    /// Brotli.
    #[serde(rename = "brotli")]
    Brotli,

    /// ZSTD.
    #[serde(rename = "zstd")]
    Zstd,

    /// XZ.
    #[serde(rename = "xz")]
    Xz,
}

impl From<CompressionType> for NixCompression {
    fn from(t: CompressionType) -> Self {
        match t {
            CompressionType::None => NixCompression::None,
            CompressionType::Brotli => NixCompression::Brotli,
            CompressionType::Zstd => NixCompression::Zstd,
            CompressionType::Xz => NixCompression::Xz,
        }
    }
}

/// LRU eviction (C9).
#[derive(Debug, Clone, Deserialize)]
pub struct EvictionConfig {
    /// The frequency to run eviction at.
    ///
    /// If zero, the periodic evictor is disabled (it can still be invoked
    /// manually).
    #[serde(with = "humantime_serde", default = "default_eviction_interval")]
    pub interval: Duration,

    /// Upper bound on concurrent physical chunk/NAR deletions during a
    /// single eviction pass.
    #[serde(rename = "max-concurrent-deletes")]
    #[serde(default = "default_eviction_max_concurrent_deletes")]
    pub max_concurrent_deletes: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval: default_eviction_interval(),
            max_concurrent_deletes: default_eviction_max_concurrent_deletes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// `tracing` filter directive (e.g. `info`, `pullcache_server=debug`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON instead of human-readable text.
    #[serde(default = "default_log_json")]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_log_json(),
        }
    }
}

fn load_database_url_from_env() -> String {
    env::var(ENV_DATABASE_URL).unwrap_or_else(|_| {
        panic!(
            "Database URL must be specified in either database.url \
            or the {ENV_DATABASE_URL} environment variable."
        )
    })
}

fn load_lock_url_from_env() -> String {
    env::var(ENV_LOCK_URL).unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

fn default_listen_address() -> SocketAddr {
    "[::]:8080".parse().unwrap()
}

fn default_db_heartbeat() -> bool {
    false
}

fn default_max_size() -> u64 {
    0
}

fn default_cache_sign_info_record() -> bool {
    true
}

fn default_record_age_ignore_touch() -> Duration {
    Duration::from_secs(3600)
}

fn default_download_poll_timeout() -> Duration {
    Duration::from_secs(45)
}

fn default_download_lock_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_lock_ttl() -> Duration {
    Duration::from_secs(1800)
}

fn default_lock_retry_max_attempts() -> u32 {
    10
}

fn default_lock_retry_initial_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_lock_retry_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_lock_retry_jitter() -> f64 {
    0.2
}

fn default_cdc_enabled() -> bool {
    true
}

fn default_cdc_nar_size_threshold() -> usize {
    128 * 1024
}

fn default_cdc_min_chunk_size() -> usize {
    16 * 1024
}

fn default_cdc_avg_chunk_size() -> usize {
    64 * 1024
}

fn default_cdc_max_chunk_size() -> usize {
    256 * 1024
}

fn default_eviction_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_eviction_max_concurrent_deletes() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_json() -> bool {
    false
}

fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configuration: {:?}", path);

    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {:?}", path))?;
    Ok(toml::from_str(&config)?)
}

fn load_config_from_str(s: &str) -> Result<Config> {
    tracing::info!("Using configuration from environment variable");
    Ok(toml::from_str(s)?)
}

/// Loads the configuration in the standard order of precedence:
///
/// 1. Path given on the command line.
/// 2. Base64-encoded TOML in `PULLCACHE_SERVER_CONFIG_BASE64`.
/// 3. The XDG config path (`$XDG_CONFIG_HOME/pullcache/server.toml`).
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    if let Some(config_path) = config_path {
        return load_config_from_path(config_path);
    }

    if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        let decoded = BASE64_STANDARD
            .decode(config_env.as_bytes())
            .context("failed to base64-decode PULLCACHE_SERVER_CONFIG_BASE64")?;
        let decoded =
            String::from_utf8(decoded).context("configuration is not valid UTF-8")?;
        return load_config_from_str(&decoded);
    }

    let xdg_path = get_xdg_config_path()?;
    load_config_from_path(&xdg_path)
}

pub fn get_xdg_config_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let config_path = xdg_dirs.place_config_file("server.toml")?;

    Ok(config_path)
}

pub fn get_xdg_data_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let data_path = xdg_dirs.create_data_directory("")?;

    Ok(data_path)
}
