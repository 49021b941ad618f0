use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::EntityKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the dashboard REST backend, e.g. https://api.example.gov/v1
  pub url: String,
  /// Per-request timeout
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

/// Freshness and retry policy for the entity cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Freshness window applied to every kind without an explicit override.
  /// When unset, each kind uses its own default.
  pub default_stale_secs: Option<u64>,
  /// Per-kind freshness overrides (e.g. `trip: 30`)
  pub stale_secs: HashMap<EntityKind, u64>,
  /// Automatic retries for reads. Writes are never retried.
  pub read_retries: u32,
  /// First retry delay; doubled on each further attempt
  pub retry_base_delay_ms: u64,
  pub retry_max_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_stale_secs: None,
      stale_secs: HashMap::new(),
      read_retries: 2,
      retry_base_delay_ms: 1_000,
      retry_max_delay_ms: 30_000,
    }
  }
}

impl CacheConfig {
  /// Freshness window for entries and lists of `kind`.
  pub fn stale_after(&self, kind: EntityKind) -> Duration {
    if let Some(secs) = self.stale_secs.get(&kind) {
      return Duration::from_secs(*secs);
    }
    match self.default_stale_secs {
      Some(secs) => Duration::from_secs(secs),
      None => kind.default_stale_after(),
    }
  }

  /// Backoff before retry number `attempt` (zero-based).
  pub fn retry_delay(&self, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let millis = self
      .retry_base_delay_ms
      .saturating_mul(factor)
      .min(self.retry_max_delay_ms);
    Duration::from_millis(millis)
  }

  pub fn with_stale_secs(mut self, kind: EntityKind, secs: u64) -> Self {
    self.stale_secs.insert(kind, secs);
    self
  }

  pub fn with_retries(mut self, retries: u32, base_delay_ms: u64) -> Self {
    self.read_retries = retries;
    self.retry_base_delay_ms = base_delay_ms;
    self
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tourdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tourdash/config.yaml
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
        "No configuration file found. Create one at ~/.config/tourdash/config.yaml\n\
                 with at least `api: {{ url: https://... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tourdash.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tourdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.api.url.trim().is_empty() {
      return Err(eyre!("api.url must not be empty"));
    }
    Ok(config)
  }

  /// Get the backend API token from environment variables.
  ///
  /// Checks TOURDASH_API_TOKEN first, then TOURDASH_TOKEN as fallback.
  /// Anonymous access is allowed, so a missing token is not an error.
  pub fn get_api_token() -> Option<String> {
    std::env::var("TOURDASH_API_TOKEN")
      .or_else(|_| std::env::var("TOURDASH_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
