use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::SqliteStorage;
use crate::classify::{Classifier, DEFAULT_BYPASS_HOSTS};
use crate::generation::{Generation, DEFAULT_GENERATION};
use crate::lifecycle::{resolve_precache, DEFAULT_INSTALL_TIMEOUT, DEFAULT_PRECACHE};
use crate::policy::DEFAULT_FETCH_TIMEOUT;

/// Scope used when no configuration file names one.
pub const DEFAULT_SCOPE: &str = "http://localhost:8080/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Base URL of the app; precache paths resolve against it and its root
  /// document is the navigation fallback
  pub scope: String,
  /// Cache generation of this release
  pub generation: String,
  /// App shell assets seeded at install, relative to the scope
  pub precache: Vec<String>,
  /// Host substrings of the live sync service (never cached, never bounded)
  pub bypass_hosts: Vec<String>,
  pub fetch_timeout_ms: u64,
  pub install_timeout_ms: u64,
  /// Optional budget for bypass requests; failures then answer with a JSON error
  pub bypass_timeout_ms: Option<u64>,
  /// SQLite database path (default: $XDG_DATA_HOME/offline-shell/cache.db)
  pub database: Option<PathBuf>,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      scope: DEFAULT_SCOPE.to_string(),
      generation: DEFAULT_GENERATION.to_string(),
      precache: DEFAULT_PRECACHE.iter().map(|p| p.to_string()).collect(),
      bypass_hosts: DEFAULT_BYPASS_HOSTS.iter().map(|h| h.to_string()).collect(),
      fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT.as_millis() as u64,
      install_timeout_ms: DEFAULT_INSTALL_TIMEOUT.as_millis() as u64,
      bypass_timeout_ms: None,
      database: None,
      log_file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-shell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-shell/config.yaml
  ///
  /// Without any file the built-in release defaults apply.
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
    let local = PathBuf::from("offline-shell.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-shell").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    self.scope_url()?;
    if self.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }
    if self.fetch_timeout_ms == 0 || self.install_timeout_ms == 0 {
      return Err(eyre!("timeouts must be greater than zero"));
    }
    Ok(())
  }

  /// The scope as a URL, always ending in a slash so relative paths stay inside it.
  pub fn scope_url(&self) -> Result<Url> {
    let mut scope =
      Url::parse(&self.scope).map_err(|e| eyre!("Invalid scope '{}': {}", self.scope, e))?;
    if !scope.path().ends_with('/') {
      let path = format!("{}/", scope.path());
      scope.set_path(&path);
    }
    Ok(scope)
  }

  pub fn generation(&self) -> Generation {
    Generation::new(self.generation.clone())
  }

  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    resolve_precache(&self.scope_url()?, &self.precache)
  }

  pub fn classifier(&self) -> Classifier {
    Classifier::new(self.bypass_hosts.iter().cloned())
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.fetch_timeout_ms)
  }

  pub fn install_timeout(&self) -> Duration {
    Duration::from_millis(self.install_timeout_ms)
  }

  pub fn bypass_timeout(&self) -> Option<Duration> {
    self.bypass_timeout_ms.map(Duration::from_millis)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}
