use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::remote::QueryDescriptor;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub monitor: MonitorConfig,
  /// Logical resources, keyed by resource name (e.g. "products")
  #[serde(default)]
  pub resources: BTreeMap<String, QueryDescriptor>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  /// Per-request timeout of the HTTP client
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// How often live feeds poll for changes
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      url: String::new(),
      timeout_ms: default_timeout_ms(),
      poll_interval_ms: default_poll_interval_ms(),
    }
  }
}

fn default_timeout_ms() -> u64 {
  10_000
}

fn default_poll_interval_ms() -> u64 {
  5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Set to false to run without a local fallback cache
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// SQLite file (default: $XDG_DATA_HOME/catalog-sync/cache.db)
  pub path: Option<PathBuf>,
  /// Payloads served when a resource has never been cached
  #[serde(default)]
  pub defaults: BTreeMap<String, Value>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      defaults: BTreeMap::new(),
    }
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub jitter_ratio: f64,
  pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 8_000,
      jitter_ratio: 0.2,
      attempt_timeout_ms: 10_000,
    }
  }
}

impl RetryConfig {
  pub fn to_policy(&self) -> Result<RetryPolicy> {
    if self.max_attempts == 0 {
      return Err(eyre!("retry.max_attempts must be at least 1"));
    }
    if !(0.0..=1.0).contains(&self.jitter_ratio) {
      return Err(eyre!(
        "retry.jitter_ratio must be within [0, 1], got {}",
        self.jitter_ratio
      ));
    }
    if self.max_delay_ms < self.base_delay_ms {
      return Err(eyre!("retry.max_delay_ms must not be below retry.base_delay_ms"));
    }

    Ok(
      RetryPolicy::new(
        self.max_attempts,
        Duration::from_millis(self.base_delay_ms),
        Duration::from_millis(self.max_delay_ms),
      )
      .with_jitter(self.jitter_ratio)
      .with_attempt_timeout(Duration::from_millis(self.attempt_timeout_ms)),
    )
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
  pub probe_timeout_ms: u64,
  pub check_interval_secs: u64,
  /// Collection read (limit 1) by the connectivity probe
  pub probe_collection: String,
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      probe_timeout_ms: 3_000,
      check_interval_secs: 30,
      probe_collection: "health".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  /// Directory for daily-rotated log files; stderr only when unset
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./catalog-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/catalog-sync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/catalog-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("catalog-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("catalog-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.retry.to_policy()?;
    Ok(config)
  }

  pub fn resource(&self, name: &str) -> Result<&QueryDescriptor> {
    self.resources.get(name).ok_or_else(|| {
      let known: Vec<&str> = self.resources.keys().map(String::as_str).collect();
      eyre!(
        "Unknown resource '{}'. Configured resources: {}",
        name,
        known.join(", ")
      )
    })
  }

  /// Bearer token for the remote store.
  ///
  /// Checks CATALOG_SYNC_TOKEN; requests go out unauthenticated without it.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CATALOG_SYNC_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
