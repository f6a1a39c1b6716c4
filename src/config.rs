use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub listeners: ListenerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the backend API (e.g. "https://api.example.com/bookclub")
  pub base_url: String,
  /// How often live queries poll the backend
  #[serde(default = "default_poll_interval_secs")]
  pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix for cache keys in durable storage
  pub namespace: String,
  pub default_ttl_minutes: i64,
  pub sweep_interval_secs: u64,
  /// Keep entries across restarts (SQLite) or only in memory
  pub persistent: bool,
  /// Database path (defaults to $XDG_DATA_HOME/bookclub/cache.db)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      namespace: crate::cache::DEFAULT_NAMESPACE.to_string(),
      default_ttl_minutes: 5,
      sweep_interval_secs: 300,
      persistent: true,
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
  /// How long an unused live query stays subscribed
  pub idle_grace_secs: u64,
}

impl Default for ListenerConfig {
  fn default() -> Self {
    Self {
      idle_grace_secs: crate::listener::DEFAULT_IDLE_GRACE.as_secs(),
    }
  }
}

fn default_poll_interval_secs() -> u64 {
  10
}

/// Convert a TTL in minutes, rejecting values chrono cannot represent.
pub fn ttl_from_minutes(minutes: i64) -> Result<chrono::Duration> {
  if minutes < 0 {
    return Err(eyre!("TTL must not be negative, got {} minutes", minutes));
  }
  chrono::Duration::try_minutes(minutes)
    .ok_or_else(|| eyre!("TTL of {} minutes is out of range", minutes))
}

impl RemoteConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Result<chrono::Duration> {
    ttl_from_minutes(self.default_ttl_minutes)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs.max(1))
  }
}

impl ListenerConfig {
  pub fn idle_grace(&self) -> Duration {
    Duration::from_secs(self.idle_grace_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bookclub.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bookclub/config.yaml
  ///
  /// Without any file the defaults apply.
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
    let local = PathBuf::from("bookclub.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("bookclub").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config
      .cache
      .default_ttl()
      .map_err(|e| eyre!("Invalid cache.default_ttl_minutes: {}", e))?;
    Ok(config)
  }

  /// The remote section, required by commands that talk to the backend.
  pub fn remote(&self) -> Result<&RemoteConfig> {
    self.remote.as_ref().ok_or_else(|| {
      eyre!(
        "No remote backend configured. Add a `remote.base_url` entry to ~/.config/bookclub/config.yaml"
      )
    })
  }

  /// Get the backend API token from the environment, if set.
  ///
  /// Checks BOOKCLUB_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("BOOKCLUB_API_TOKEN").ok().filter(|token| !token.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert!(config.remote.is_none());
    assert!(config.remote().is_err());
    assert_eq!(config.cache.namespace, "cache_");
    assert_eq!(config.cache.default_ttl().unwrap(), chrono::Duration::minutes(5));
    assert_eq!(config.cache.sweep_interval(), Duration::from_secs(300));
    assert!(config.cache.persistent);
    assert_eq!(config.listeners.idle_grace(), Duration::from_secs(300));
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
remote:
  base_url: https://api.example.com/bookclub
cache:
  namespace: "bc_"
  default_ttl_minutes: 10
  persistent: false
  database: /tmp/bookclub.db
listeners:
  idle_grace_secs: 30
"#,
    )
    .unwrap();

    let remote = config.remote().unwrap();
    assert_eq!(remote.base_url, "https://api.example.com/bookclub");
    assert_eq!(remote.poll_interval(), Duration::from_secs(10));
    assert_eq!(config.cache.namespace, "bc_");
    assert_eq!(config.cache.default_ttl().unwrap(), chrono::Duration::minutes(10));
    assert_eq!(config.cache.sweep_interval_secs, 300);
    assert!(!config.cache.persistent);
    assert_eq!(config.cache.database, Some(PathBuf::from("/tmp/bookclub.db")));
    assert_eq!(config.listeners.idle_grace(), Duration::from_secs(30));
  }

  #[test]
  fn test_out_of_range_ttl_is_rejected() {
    let err = Config::parse("cache:\n  default_ttl_minutes: 9223372036854775807").unwrap_err();
    assert!(err.to_string().contains("default_ttl_minutes"));

    assert!(Config::parse("cache:\n  default_ttl_minutes: -1").is_err());
    assert!(ttl_from_minutes(i64::MAX).is_err());
    assert_eq!(ttl_from_minutes(0).unwrap(), chrono::Duration::zero());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/bookclub.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
