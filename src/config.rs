use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::classify::Partition;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the application talks to; relative request URLs resolve
  /// against it.
  pub origin: String,
  /// Version tag for this deployment's partition set. Defaults to the
  /// crate version, so a new build rotates partitions on activation.
  pub generation: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routing: RoutingConfig,
  /// Critical assets (the application shell) pre-warmed at install.
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  #[serde(default)]
  pub notifications: NotificationConfig,
}

fn default_precache() -> Vec<String> {
  vec!["/".to_string()]
}

/// Per-partition staleness policy, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub static_max_age_seconds: u64,
  pub images_max_age_seconds: u64,
  pub api_max_age_seconds: u64,
  pub runtime_max_age_seconds: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_max_age_seconds: 7 * 24 * 3600,
      images_max_age_seconds: 30 * 24 * 3600,
      api_max_age_seconds: 5 * 60,
      runtime_max_age_seconds: 24 * 3600,
    }
  }
}

impl CacheConfig {
  pub fn max_ages(&self) -> BTreeMap<Partition, Duration> {
    let mut ages = BTreeMap::new();
    ages.insert(Partition::Static, Duration::seconds(self.static_max_age_seconds as i64));
    ages.insert(Partition::Images, Duration::seconds(self.images_max_age_seconds as i64));
    ages.insert(Partition::Api, Duration::seconds(self.api_max_age_seconds as i64));
    ages.insert(Partition::Runtime, Duration::seconds(self.runtime_max_age_seconds as i64));
    ages
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Prefix of the static asset bundle.
  pub asset_prefix: String,
  /// Prefix of the business API.
  pub api_prefix: String,
  /// Substring markers for paths that must never be intercepted.
  pub exclusions: Vec<String>,
  /// Key of the pre-cached document served to offline navigations.
  pub root_document: String,
  pub fetch_timeout_seconds: u64,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    Self {
      asset_prefix: "/assets/".to_string(),
      api_prefix: "/api/".to_string(),
      exclusions: vec![
        "/server/".to_string(),
        ".server.".to_string(),
        "/__internal/".to_string(),
      ],
      root_document: "/".to_string(),
      fetch_timeout_seconds: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_icon: String,
  /// View name → path table owned by the business layer.
  pub view_routes: BTreeMap<String, String>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_icon: "/assets/icon-192.png".to_string(),
      view_routes: BTreeMap::new(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./holdfast.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/holdfast/config.yaml
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
        "No configuration file found. Create one at ~/.config/holdfast/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("holdfast.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("holdfast").join("config.yaml");
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

  pub fn generation(&self) -> String {
    self
      .generation
      .clone()
      .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")))
  }

  pub fn fetch_timeout(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.routing.fetch_timeout_seconds)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_gets_defaults() {
    let config: Config = serde_yaml::from_str("origin: https://app.example.com\n").unwrap();

    assert_eq!(config.origin, "https://app.example.com");
    assert_eq!(config.precache, vec!["/".to_string()]);
    assert_eq!(config.routing.api_prefix, "/api/");
    assert_eq!(config.cache.api_max_age_seconds, 300);
    assert_eq!(config.fetch_timeout(), std::time::Duration::from_secs(10));
    assert!(config.generation().starts_with('v'));
  }

  #[test]
  fn test_explicit_values_override_defaults() {
    let yaml = r#"
origin: https://app.example.com
generation: v42
cache:
  api_max_age_seconds: 60
routing:
  api_prefix: /v2/api/
  exclusions: ["/private/"]
precache:
  - /
  - /assets/app.js
notifications:
  view_routes:
    chat: /chat
"#;
    let config: Config = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.generation(), "v42");
    assert_eq!(config.cache.api_max_age_seconds, 60);
    // Unset cache fields keep their defaults.
    assert_eq!(config.cache.images_max_age_seconds, 30 * 24 * 3600);
    assert_eq!(config.routing.api_prefix, "/v2/api/");
    assert_eq!(config.routing.exclusions, vec!["/private/".to_string()]);
    assert_eq!(config.precache.len(), 2);
    assert_eq!(
      config.notifications.view_routes.get("chat").map(String::as_str),
      Some("/chat")
    );
  }

  #[test]
  fn test_max_ages_cover_every_partition() {
    let ages = CacheConfig::default().max_ages();
    for partition in Partition::ALL {
      assert!(ages.contains_key(&partition));
    }
    assert_eq!(ages[&Partition::Api], Duration::minutes(5));
  }
}
