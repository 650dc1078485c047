use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

use crate::store::BucketPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application being served (scheme + host + port). Requests
  /// to any other origin bypass the cache entirely.
  pub base_origin: String,
  /// Cache version tag. Entries written under a different tag are purged on
  /// startup.
  #[serde(default = "default_version")]
  pub version: String,
  /// Database file location (defaults to the platform data directory)
  pub db_path: Option<PathBuf>,
  #[serde(default = "default_buckets")]
  pub buckets: BTreeMap<String, BucketPolicy>,
  #[serde(default)]
  pub routes: RouteRules,
  #[serde(default)]
  pub retry: RetryPolicy,
  /// Upper bound on a single interception-layer network attempt
  #[serde(default = "default_fetch_timeout_secs")]
  pub fetch_timeout_secs: u64,
  /// Upper bound on a single queued-mutation replay attempt
  #[serde(default = "default_replay_timeout_secs")]
  pub replay_timeout_secs: u64,
  /// Settle window after an offline-to-online edge before a drain fires
  #[serde(default = "default_reconnect_debounce_ms")]
  pub reconnect_debounce_ms: u64,
  /// Periodic drain interval for entries waiting out their backoff
  /// (0 disables the timer)
  #[serde(default = "default_backstop_interval_secs")]
  pub backstop_interval_secs: u64,
  /// Connectivity assumption at startup, before the first platform signal
  #[serde(default = "default_start_online")]
  pub start_online: bool,
}

/// Route classification overrides. Same-origin paths match API prefixes
/// first, then image extensions, then static extensions, and fall back to
/// html-page.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRules {
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
  #[serde(default = "default_static_extensions")]
  pub static_extensions: Vec<String>,
  #[serde(default = "default_image_extensions")]
  pub image_extensions: Vec<String>,
}

impl Default for RouteRules {
  fn default() -> Self {
    Self {
      api_prefixes: default_api_prefixes(),
      static_extensions: default_static_extensions(),
      image_extensions: default_image_extensions(),
    }
  }
}

/// Bounded retry with exponential backoff for queued mutations. An entry
/// that fails `max_attempts` times is moved to the dead-letter table.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryPolicy {
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_base_delay_secs")]
  pub base_delay_secs: u64,
  #[serde(default = "default_max_delay_secs")]
  pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: default_max_attempts(),
      base_delay_secs: default_base_delay_secs(),
      max_delay_secs: default_max_delay_secs(),
    }
  }
}

fn default_version() -> String {
  format!("v{}", env!("CARGO_PKG_VERSION"))
}

fn default_buckets() -> BTreeMap<String, BucketPolicy> {
  BTreeMap::from([
    (
      "static".to_string(),
      BucketPolicy {
        max_entries: 200,
        ttl_secs: Some(30 * 24 * 3600),
      },
    ),
    (
      "runtime".to_string(),
      BucketPolicy {
        max_entries: 50,
        ttl_secs: Some(24 * 3600),
      },
    ),
    (
      "api".to_string(),
      BucketPolicy {
        max_entries: 100,
        ttl_secs: Some(300),
      },
    ),
    (
      "image".to_string(),
      BucketPolicy {
        max_entries: 150,
        ttl_secs: Some(7 * 24 * 3600),
      },
    ),
  ])
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string()]
}

fn default_static_extensions() -> Vec<String> {
  ["css", "js", "mjs", "map", "woff", "woff2", "ttf", "otf"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_image_extensions() -> Vec<String> {
  ["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_fetch_timeout_secs() -> u64 {
  10
}

fn default_replay_timeout_secs() -> u64 {
  15
}

fn default_reconnect_debounce_ms() -> u64 {
  500
}

fn default_backstop_interval_secs() -> u64 {
  300
}

fn default_start_online() -> bool {
  true
}

fn default_max_attempts() -> u32 {
  8
}

fn default_base_delay_secs() -> u64 {
  30
}

fn default_max_delay_secs() -> u64 {
  3600
}

impl Config {
  /// Programmatic configuration with defaults for everything but the origin.
  pub fn for_origin(origin: &str) -> Result<Self> {
    // Validate eagerly so embedders fail at construction, not first fetch
    Url::parse(origin).map_err(|e| eyre!("Invalid base origin '{}': {}", origin, e))?;

    Ok(Self {
      base_origin: origin.to_string(),
      version: default_version(),
      db_path: None,
      buckets: default_buckets(),
      routes: RouteRules::default(),
      retry: RetryPolicy::default(),
      fetch_timeout_secs: default_fetch_timeout_secs(),
      replay_timeout_secs: default_replay_timeout_secs(),
      reconnect_debounce_ms: default_reconnect_debounce_ms(),
      backstop_interval_secs: default_backstop_interval_secs(),
      start_online: default_start_online(),
    })
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./backhaul.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/backhaul/config.yaml
  /// 4. ~/.config/backhaul/config.yaml
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
        "No configuration file found. Create one at ~/.config/backhaul/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("backhaul.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("backhaul").join("config.yaml");
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

    config.validate()?;

    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    Url::parse(&self.base_origin)
      .map_err(|e| eyre!("Invalid base origin '{}': {}", self.base_origin, e))?;

    if self.retry.max_attempts == 0 {
      return Err(eyre!("retry.max_attempts must be at least 1"));
    }

    for (name, policy) in &self.buckets {
      if policy.max_entries == 0 {
        return Err(eyre!("Bucket '{}' must allow at least one entry", name));
      }
    }

    Ok(())
  }

  /// Parsed application origin.
  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.base_origin)
      .map_err(|e| eyre!("Invalid base origin '{}': {}", self.base_origin, e))
  }

  /// Resolve the database location, defaulting to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.db_path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("backhaul").join("offline.db"))
  }
}
