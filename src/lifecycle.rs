//! Install / activate lifecycle of one worker version.
//!
//! Installing seeds the current generation's store with the precache manifest,
//! all or nothing. Activating deletes every other generation's store and claims
//! the open pages. A failed install makes the worker redundant, so a broken
//! release never displaces the generation that is already serving.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, RequestKey};
use crate::generation::Generation;
use crate::net::{fetch_bounded, Network};
use crate::request::{Request, Response};

/// App shell assets, relative to the scope.
pub const DEFAULT_PRECACHE: &[&str] = &[
  "./",
  "./index.html",
  "./manifest.json",
  "./icon-192.png",
  "./icon-512.png",
];

/// Per-asset budget while seeding.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Seeded, waiting to activate
  Installed,
  Activating,
  /// Controls clients and intercepts fetches
  Activated,
  /// Failed install or activation; never serves
  Redundant,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
  #[error("failed to precache {url}: {reason}")]
  Seeding { url: String, reason: String },
  #[error("cannot {action} a worker that is {actual}")]
  InvalidState {
    action: &'static str,
    actual: WorkerState,
  },
}

pub struct LifecycleManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  generation: Generation,
  precache: Vec<Url>,
  install_timeout: Duration,
  skip_waiting: bool,
  state: watch::Sender<WorkerState>,
}

impl<S: CacheStorage, N: Network> LifecycleManager<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, generation: Generation, precache: Vec<Url>) -> Self {
    let (state, _) = watch::channel(WorkerState::Parsed);
    Self {
      storage,
      network,
      generation,
      precache,
      install_timeout: DEFAULT_INSTALL_TIMEOUT,
      skip_waiting: false,
      state,
    }
  }

  pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
    self.install_timeout = timeout;
    self
  }

  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  /// Follow state changes from other tasks.
  pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
    self.state.subscribe()
  }

  /// Whether an installed worker may activate without waiting for old pages.
  pub fn skip_waiting(&self) -> bool {
    self.skip_waiting
  }

  fn set_state(&self, state: WorkerState) {
    debug!(generation = %self.generation, %state, "worker state");
    self.state.send_replace(state);
  }

  fn expect_state(&self, expected: WorkerState, action: &'static str) -> Result<()> {
    let actual = self.state();
    if actual != expected {
      return Err(LifecycleError::InvalidState { action, actual }.into());
    }
    Ok(())
  }

  /// Bring the worker into control: resume if this generation was already
  /// installed by an earlier run, otherwise install and activate.
  pub async fn start(&mut self) -> Result<()> {
    if self.resume()? {
      return Ok(());
    }
    self.install().await?;
    if self.skip_waiting() {
      self.activate()?;
    }
    Ok(())
  }

  /// Take control directly when the current generation's store already exists.
  ///
  /// The store may have been seeded by an install that never got to activate,
  /// so other generations are collected here as well.
  pub fn resume(&mut self) -> Result<bool> {
    self.expect_state(WorkerState::Parsed, "resume")?;
    if !self.storage.has(self.generation.as_str())? {
      return Ok(false);
    }
    info!(generation = %self.generation, "resuming installed generation");

    if let Err(err) = self.collect_garbage() {
      self.set_state(WorkerState::Redundant);
      return Err(err);
    }
    self.set_state(WorkerState::Activated);
    Ok(true)
  }

  /// Seed the current generation's store with every precache asset.
  pub async fn install(&mut self) -> Result<()> {
    self.expect_state(WorkerState::Parsed, "install")?;
    self.set_state(WorkerState::Installing);
    info!(
      generation = %self.generation,
      assets = self.precache.len(),
      "installing"
    );

    let fetched = try_join_all(self.precache.iter().map(|url| self.fetch_asset(url))).await;
    let entries = match fetched {
      Ok(entries) => entries,
      Err(err) => {
        warn!(generation = %self.generation, error = %err, "install failed");
        self.set_state(WorkerState::Redundant);
        return Err(err.into());
      }
    };

    if let Err(err) = self.storage.put_all(self.generation.as_str(), &entries) {
      self.set_state(WorkerState::Redundant);
      return Err(err);
    }

    self.skip_waiting = true;
    self.set_state(WorkerState::Installed);
    info!(generation = %self.generation, entries = entries.len(), "installed");
    Ok(())
  }

  async fn fetch_asset(&self, url: &Url) -> Result<(RequestKey, Response), LifecycleError> {
    let request = Request::get(url.clone());
    let key = RequestKey::for_request(&request);

    let response = fetch_bounded(self.network.as_ref(), request, self.install_timeout)
      .await
      .map_err(|e| LifecycleError::Seeding {
        url: url.to_string(),
        reason: e.to_string(),
      })?;

    if !response.is_ok() {
      return Err(LifecycleError::Seeding {
        url: url.to_string(),
        reason: format!("HTTP {} {}", response.status, response.status_text),
      });
    }

    Ok((key, response))
  }

  /// Delete every other generation's store, then claim clients.
  ///
  /// Returns the names of the deleted stores.
  pub fn activate(&mut self) -> Result<Vec<String>> {
    self.expect_state(WorkerState::Installed, "activate")?;
    self.set_state(WorkerState::Activating);

    match self.collect_garbage() {
      Ok(deleted) => {
        self.set_state(WorkerState::Activated);
        info!(generation = %self.generation, "activated, clients claimed");
        Ok(deleted)
      }
      Err(err) => {
        self.set_state(WorkerState::Redundant);
        Err(err)
      }
    }
  }

  fn collect_garbage(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.names()? {
      if self.generation.owns(&name) {
        continue;
      }
      self.storage.delete(&name)?;
      info!(store = %name, "deleted stale generation");
      deleted.push(name);
    }
    Ok(deleted)
  }
}

/// Resolve manifest entries against the scope.
pub fn resolve_precache<I, P>(scope: &Url, paths: I) -> Result<Vec<Url>>
where
  I: IntoIterator<Item = P>,
  P: AsRef<str>,
{
  paths
    .into_iter()
    .map(|path| {
      scope
        .join(path.as_ref())
        .map_err(|e| eyre!("Invalid precache entry '{}': {}", path.as_ref(), e))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::testing::{Reply, ScriptedNetwork};
  use reqwest::Method;

  const SCOPE: &str = "http://localhost:8080/";

  fn scope() -> Url {
    Url::parse(SCOPE).unwrap()
  }

  fn ok(path: &str) -> (String, Reply) {
    let url = scope().join(path).unwrap().to_string();
    let reply = Reply::Respond(Response::new(200, format!("body of {}", path)));
    (url, reply)
  }

  fn network(replies: Vec<(String, Reply)>) -> ScriptedNetwork {
    replies
      .into_iter()
      .fold(ScriptedNetwork::new(), |net, (url, reply)| net.reply(&url, reply))
  }

  fn manager(
    storage: &Arc<SqliteStorage>,
    network: ScriptedNetwork,
    generation: &str,
    paths: &[&str],
  ) -> LifecycleManager<SqliteStorage, ScriptedNetwork> {
    LifecycleManager::new(
      Arc::clone(storage),
      Arc::new(network),
      Generation::new(generation),
      resolve_precache(&scope(), paths).unwrap(),
    )
  }

  fn key(path: &str) -> RequestKey {
    RequestKey::new(&Method::GET, &scope().join(path).unwrap())
  }

  #[tokio::test]
  async fn test_install_seeds_exactly_the_manifest() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let paths = ["/", "/index.html", "/manifest.json"];
    let mut manager = manager(
      &storage,
      network(paths.iter().map(|p| ok(p)).collect()),
      "G",
      &paths,
    );

    manager.install().await.unwrap();

    assert_eq!(manager.state(), WorkerState::Installed);
    assert!(manager.skip_waiting());
    assert_eq!(storage.len("G").unwrap(), 3);
    for path in paths {
      assert!(storage.get("G", &key(path)).unwrap().is_some(), "{}", path);
    }
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put("v3", &key("/"), &Response::new(200, "old shell")).unwrap();
    let mut replies = vec![ok("./"), ok("./index.html")];
    replies.push((
      scope().join("./manifest.json").unwrap().to_string(),
      Reply::Respond(Response::new(404, "")),
    ));
    let mut manager = manager(
      &storage,
      network(replies),
      "v4",
      &["./", "./index.html", "./manifest.json"],
    );

    let err = manager.install().await.unwrap_err();

    match err.downcast_ref::<LifecycleError>() {
      Some(LifecycleError::Seeding { url, reason }) => {
        assert!(url.ends_with("/manifest.json"));
        assert!(reason.contains("404"));
      }
      other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(manager.state(), WorkerState::Redundant);
    assert!(!storage.has("v4").unwrap());
    assert_eq!(storage.len("v3").unwrap(), 1);

    let err = manager.activate().unwrap_err();
    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::InvalidState { .. })
    ));
    assert!(storage.has("v3").unwrap());
  }

  #[tokio::test]
  async fn test_stalled_asset_fails_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let replies = vec![
      ok("./"),
      (scope().join("./icon-512.png").unwrap().to_string(), Reply::Hang),
    ];
    let mut manager = manager(&storage, network(replies), "v4", &["./", "./icon-512.png"])
      .with_install_timeout(Duration::from_millis(50));

    let err = manager.install().await.unwrap_err();

    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::Seeding { .. })
    ));
    assert!(!storage.has("v4").unwrap());
  }

  #[tokio::test]
  async fn test_activate_deletes_other_generations() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put("v3", &key("/"), &Response::new(200, "old")).unwrap();
    storage.put("v4", &key("/extra.js"), &Response::new(200, "kept")).unwrap();
    let mut manager = manager(&storage, network(vec![ok("./")]), "v4", &["./"]);

    manager.install().await.unwrap();
    let deleted = manager.activate().unwrap();

    assert_eq!(deleted, vec!["v3".to_string()]);
    assert_eq!(manager.state(), WorkerState::Activated);
    assert_eq!(storage.names().unwrap(), vec!["v4"]);
    assert!(storage.get("v3", &key("/")).unwrap().is_none());
    assert_eq!(storage.len("v4").unwrap(), 2);
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put_all("v3", &[]).unwrap();
    let mut manager = manager(&storage, ScriptedNetwork::new(), "v4", &[]);

    assert!(manager.activate().is_err());
    assert!(storage.has("v3").unwrap());
    assert_eq!(manager.state(), WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_start_resumes_installed_generation_without_network() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put("v4", &key("/"), &Response::new(200, "shell")).unwrap();
    let net = Arc::new(ScriptedNetwork::new());
    let mut manager = LifecycleManager::new(
      Arc::clone(&storage),
      Arc::clone(&net),
      Generation::new("v4"),
      resolve_precache(&scope(), ["./"]).unwrap(),
    );

    manager.start().await.unwrap();

    assert_eq!(manager.state(), WorkerState::Activated);
    assert_eq!(net.call_count(), 0);
  }

  #[tokio::test]
  async fn test_start_after_bare_install_collects_old_generations() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put("v3", &key("/"), &Response::new(200, "old shell")).unwrap();

    let mut first = manager(&storage, network(vec![ok("./")]), "v4", &["./"]);
    first.install().await.unwrap();
    assert_eq!(storage.names().unwrap(), vec!["v3", "v4"]);

    let mut second = manager(&storage, ScriptedNetwork::new(), "v4", &["./"]);
    second.start().await.unwrap();

    assert_eq!(second.state(), WorkerState::Activated);
    assert_eq!(storage.names().unwrap(), vec!["v4"]);
    assert!(storage.get("v3", &key("/")).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_start_installs_and_activates_new_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.put_all("v3", &[]).unwrap();
    let mut manager = manager(&storage, network(vec![ok("./")]), "v4", &["./"]);
    let mut states = manager.subscribe();

    manager.start().await.unwrap();

    assert_eq!(*states.borrow_and_update(), WorkerState::Activated);
    assert_eq!(storage.names().unwrap(), vec!["v4"]);
  }

  #[test]
  fn test_resolve_precache_against_scope() {
    let scope = Url::parse("https://example.github.io/logbook/").unwrap();
    let urls = resolve_precache(&scope, DEFAULT_PRECACHE.iter().copied()).unwrap();

    assert_eq!(urls[0].as_str(), "https://example.github.io/logbook/");
    assert_eq!(urls[1].as_str(), "https://example.github.io/logbook/index.html");
    assert_eq!(urls.len(), DEFAULT_PRECACHE.len());
  }
}
