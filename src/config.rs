use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::FreshnessPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub base_url: String,
  pub endpoints: Endpoints,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3000/api/".into(),
      endpoints: Endpoints::default(),
      timeout_secs: 30,
    }
  }
}

/// Endpoint templates relative to `base_url`.
///
/// `{chat_id}` and `{name}` are substituted per call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Endpoints {
  pub chats: String,
  pub messages: String,
  pub search: String,
  pub setting: String,
  pub send: String,
}

impl Default for Endpoints {
  fn default() -> Self {
    Self {
      chats: "chats".into(),
      messages: "chats/{chat_id}/messages".into(),
      search: "chats/search".into(),
      setting: "settings/{name}".into(),
      send: "chats/{chat_id}/messages".into(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to run network-only
  pub enabled: bool,
  /// Database file (defaults to the platform data directory)
  pub path: Option<PathBuf>,
  pub freshness: FreshnessConfig,
  /// Messages per page for load-more
  pub page_size: usize,
  /// Chats fetched per refresh
  pub chat_page_size: usize,
  /// How long search input must settle before a network search
  pub search_debounce_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      freshness: FreshnessConfig::default(),
      page_size: 20,
      chat_page_size: 100,
      search_debounce_ms: 500,
    }
  }
}

/// Freshness thresholds in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
  pub chats_secs: i64,
  pub messages_secs: i64,
  pub settings_secs: i64,
}

impl Default for FreshnessConfig {
  fn default() -> Self {
    Self {
      chats_secs: 120,
      messages_secs: 300,
      settings_secs: 1800,
    }
  }
}

impl FreshnessConfig {
  pub fn policy(&self) -> FreshnessPolicy {
    FreshnessPolicy {
      chats: Duration::seconds(self.chats_secs),
      messages: Duration::seconds(self.messages_secs),
      settings: Duration::seconds(self.settings_secs),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./chatcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/chatcache/config.yaml
  ///
  /// Without any file the defaults are used.
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
    let local = PathBuf::from("chatcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("chatcache").join("config.yaml");
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

  pub fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the backend API token from the environment, if set.
  ///
  /// Checks CHATCACHE_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CHATCACHE_API_TOKEN").ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_partial_config_keeps_defaults() {
    let config = Config::parse(
      r#"
api:
  base_url: https://api.example.com/v2
cache:
  freshness:
    chats_secs: 30
"#,
    )
    .unwrap();

    assert_eq!(config.api.base_url, "https://api.example.com/v2");
    assert_eq!(config.api.endpoints, Endpoints::default());
    assert!(config.cache.enabled);
    assert_eq!(config.cache.page_size, 20);

    let policy = config.cache.freshness.policy();
    assert_eq!(policy.chats, Duration::seconds(30));
    assert_eq!(policy.settings, Duration::seconds(1800));
  }

  #[test]
  fn test_empty_document_is_default() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.cache.search_debounce_ms, 500);
    assert!(config.cache.path.is_none());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/chatcache.yaml"))).is_err());
  }
}
