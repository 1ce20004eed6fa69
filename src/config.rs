use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration for the subsystem.
///
/// Every field has a sensible default, so an empty file (or no file at all)
/// yields a working setup. Hosts usually only override the data directory,
/// the cache version stamp, and the sensitive-field deny-list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub backup: BackupConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Root directory for the durable tiers. Defaults to the platform data
  /// directory (`~/.local/share/lifeboat` on Linux).
  pub data_dir: Option<PathBuf>,
  /// Byte budget for the flat key-value tier before emergency eviction.
  #[serde(default = "default_flat_quota_bytes")]
  pub flat_quota_bytes: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      data_dir: None,
      flat_quota_bytes: default_flat_quota_bytes(),
    }
  }
}

impl StorageConfig {
  /// Resolve the effective data directory.
  pub fn resolve_data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("lifeboat"))
  }
}

fn default_flat_quota_bytes() -> u64 {
  5 * 1024 * 1024
}

/// TTL and capacity for one cache partition.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PartitionPolicy {
  pub ttl_secs: u64,
  pub max_entries: usize,
}

impl PartitionPolicy {
  pub fn ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.ttl_secs as i64)
  }
}

/// Per-partition policies. Immutable assets live long in a small set, API
/// responses expire fast, images live long in a larger set, general runtime
/// data sits in between.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionPolicies {
  #[serde(rename = "static", default = "default_static_policy")]
  pub static_assets: PartitionPolicy,
  #[serde(default = "default_runtime_policy")]
  pub runtime: PartitionPolicy,
  #[serde(default = "default_api_policy")]
  pub api: PartitionPolicy,
  #[serde(default = "default_image_policy")]
  pub image: PartitionPolicy,
}

impl Default for PartitionPolicies {
  fn default() -> Self {
    Self {
      static_assets: default_static_policy(),
      runtime: default_runtime_policy(),
      api: default_api_policy(),
      image: default_image_policy(),
    }
  }
}

fn default_static_policy() -> PartitionPolicy {
  PartitionPolicy {
    ttl_secs: 7 * 24 * 3600,
    max_entries: 40,
  }
}

fn default_runtime_policy() -> PartitionPolicy {
  PartitionPolicy {
    ttl_secs: 24 * 3600,
    max_entries: 50,
  }
}

fn default_api_policy() -> PartitionPolicy {
  PartitionPolicy {
    ttl_secs: 5 * 60,
    max_entries: 30,
  }
}

fn default_image_policy() -> PartitionPolicy {
  PartitionPolicy {
    ttl_secs: 30 * 24 * 3600,
    max_entries: 80,
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version stamp for the whole cache. Changing it purges every partition
  /// on the next engine start, so a new deployment never serves entries
  /// written under an old schema.
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// How often the expiry/trim sweep runs.
  #[serde(default = "default_cache_sweep_secs")]
  pub sweep_interval_secs: u64,
  /// Network timeout for cache fills.
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  #[serde(default)]
  pub partitions: PartitionPolicies,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: default_cache_version(),
      sweep_interval_secs: default_cache_sweep_secs(),
      request_timeout_secs: default_request_timeout_secs(),
      partitions: PartitionPolicies::default(),
    }
  }
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_cache_sweep_secs() -> u64 {
  600
}

fn default_request_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// First retry delay; doubles on every further failure.
  #[serde(default = "default_base_delay_ms")]
  pub base_delay_ms: u64,
  /// Ceiling for the backoff delay.
  #[serde(default = "default_max_delay_ms")]
  pub max_delay_ms: u64,
  /// Delivery attempts before an item becomes a dead letter.
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Foreground sweep cadence used when no deferred-sweep scheduler is
  /// registered.
  #[serde(default = "default_sync_sweep_secs")]
  pub sweep_interval_secs: u64,
  /// Network timeout for deliveries.
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: default_base_delay_ms(),
      max_delay_ms: default_max_delay_ms(),
      max_attempts: default_max_attempts(),
      sweep_interval_secs: default_sync_sweep_secs(),
      request_timeout_secs: default_request_timeout_secs(),
    }
  }
}

fn default_base_delay_ms() -> u64 {
  1000
}

fn default_max_delay_ms() -> u64 {
  30_000
}

fn default_max_attempts() -> u32 {
  5
}

fn default_sync_sweep_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
  /// Cadence of periodic session captures.
  #[serde(default = "default_backup_interval_secs")]
  pub periodic_interval_secs: u64,
  /// A snapshot older than this is never offered for recovery.
  #[serde(default = "default_recency_window_secs")]
  pub recency_window_secs: u64,
  /// Periodic snapshots older than this are deleted opportunistically.
  #[serde(default = "default_retention_secs")]
  pub retention_secs: u64,
  /// Hard cap on the snapshot index.
  #[serde(default = "default_max_snapshots")]
  pub max_snapshots: usize,
  /// Navigation history entries kept per snapshot.
  #[serde(default = "default_history_limit")]
  pub history_limit: usize,
  /// Recent-error entries kept per snapshot.
  #[serde(default = "default_error_log_limit")]
  pub error_log_limit: usize,
  /// Case-insensitive substrings marking a field as sensitive. Matching
  /// fields are never captured.
  #[serde(default = "default_sensitive_patterns")]
  pub sensitive_patterns: Vec<String>,
}

impl Default for BackupConfig {
  fn default() -> Self {
    Self {
      periodic_interval_secs: default_backup_interval_secs(),
      recency_window_secs: default_recency_window_secs(),
      retention_secs: default_retention_secs(),
      max_snapshots: default_max_snapshots(),
      history_limit: default_history_limit(),
      error_log_limit: default_error_log_limit(),
      sensitive_patterns: default_sensitive_patterns(),
    }
  }
}

fn default_backup_interval_secs() -> u64 {
  300
}

fn default_recency_window_secs() -> u64 {
  3600
}

fn default_retention_secs() -> u64 {
  24 * 3600
}

fn default_max_snapshots() -> usize {
  20
}

fn default_history_limit() -> usize {
  10
}

fn default_error_log_limit() -> usize {
  10
}

fn default_sensitive_patterns() -> Vec<String> {
  [
    "password", "passwd", "secret", "token", "api_key", "card", "cvv", "ssn", "pin",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (an error if it does not exist)
  /// 2. ./lifeboat.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lifeboat/config.yaml
  ///
  /// When nothing is found the built-in defaults apply; an embedded
  /// subsystem must come up without any configuration present.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("lifeboat.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lifeboat").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_complete() {
    let config = Config::default();
    assert_eq!(config.sync.base_delay_ms, 1000);
    assert_eq!(config.sync.max_delay_ms, 30_000);
    assert_eq!(config.sync.max_attempts, 5);
    assert_eq!(config.cache.partitions.api.max_entries, 30);
    assert_eq!(config.backup.max_snapshots, 20);
    assert!(config
      .backup
      .sensitive_patterns
      .iter()
      .any(|p| p == "password"));
  }

  #[test]
  fn test_partial_yaml_fills_defaults() {
    let yaml = r#"
sync:
  max_attempts: 8
cache:
  version: "v7"
  partitions:
    api:
      ttl_secs: 60
      max_entries: 10
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.sync.max_attempts, 8);
    assert_eq!(config.sync.base_delay_ms, 1000);
    assert_eq!(config.cache.version, "v7");
    assert_eq!(config.cache.partitions.api.max_entries, 10);
    // Untouched partitions keep their defaults
    assert_eq!(config.cache.partitions.image.max_entries, 80);
  }

  #[test]
  fn test_static_partition_uses_yaml_keyword_name() {
    let yaml = r#"
cache:
  partitions:
    static:
      ttl_secs: 120
      max_entries: 4
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(config.cache.partitions.static_assets.ttl_secs, 120);
    assert_eq!(config.cache.partitions.static_assets.max_entries, 4);
  }
}
