//! Fetch interception policy.
//!
//! Cacheable requests are served cache-first. On a miss the network gets one
//! attempt bounded by a timeout; complete same-origin 200 responses are written
//! back to the current generation's store. When the network fails or stalls,
//! navigations fall back to the stored app shell and everything else gets an
//! explicit 503, so a cacheable request never hangs.
//!
//! Bypass requests are handed back untouched for the caller to deliver.

use reqwest::Method;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, RequestKey};
use crate::classify::{BypassReason, Classification, Classifier};
use crate::generation::Generation;
use crate::net::{fetch_bounded, Network};
use crate::request::{Request, Response};

/// Budget for a cacheable network attempt.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Current generation store, no network contact
  Cache,
  /// Network response within the budget (stored or not)
  Network,
  /// Network failed; stored root document served for a navigation
  NavigationFallback,
  /// Network failed and nothing usable was stored
  Unavailable,
  /// Bypass request delivered straight from the network
  Passthrough,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Cache => "cache",
      Self::Network => "network",
      Self::NavigationFallback => "fallback",
      Self::Unavailable => "unavailable",
      Self::Passthrough => "passthrough",
    };
    f.write_str(label)
  }
}

#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
}

impl Served {
  pub fn new(response: Response, source: ResponseSource) -> Self {
    Self { response, source }
  }
}

/// Outcome of intercepting one request.
#[derive(Debug)]
pub enum Disposition {
  /// Not ours: deliver the original request to the network as-is
  Passthrough(Request, BypassReason),
  /// Answered by the policy
  Respond(Served),
}

pub struct InterceptionPolicy<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  classifier: Classifier,
  generation: Generation,
  /// Root document of the app shell
  root: Url,
  timeout: Duration,
}

impl<S: CacheStorage, N: Network> InterceptionPolicy<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, generation: Generation, root: Url) -> Self {
    Self {
      storage,
      network,
      classifier: Classifier::default(),
      generation,
      root,
      timeout: DEFAULT_FETCH_TIMEOUT,
    }
  }

  pub fn with_classifier(mut self, classifier: Classifier) -> Self {
    self.classifier = classifier;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  /// Decide what happens to `request`. Never fails.
  pub async fn handle(&self, request: Request) -> Disposition {
    match self.classifier.classify(&request) {
      Classification::Bypass(reason) => {
        debug!(url = %request.url, method = %request.method, ?reason, "bypass");
        Disposition::Passthrough(request, reason)
      }
      Classification::Cacheable => Disposition::Respond(self.cache_first(request).await),
    }
  }

  async fn cache_first(&self, request: Request) -> Served {
    let key = RequestKey::for_request(&request);

    if let Some(cached) = self.lookup(&key) {
      debug!(key = %key.description(), cached_at = %cached.cached_at, "cache hit");
      return Served::new(cached.response, ResponseSource::Cache);
    }

    let navigation = request.is_navigation();
    match fetch_bounded(self.network.as_ref(), request, self.timeout).await {
      Ok(response) => {
        if response.is_storable() {
          self.write_back(&key, &response);
        } else {
          debug!(
            key = %key.description(),
            status = response.status,
            response_type = ?response.response_type,
            "not storing response"
          );
        }
        Served::new(response, ResponseSource::Network)
      }
      Err(err) => {
        warn!(key = %key.description(), error = %err, "network unavailable");
        self.fallback(navigation)
      }
    }
  }

  /// Lookup in the current generation; storage trouble counts as a miss.
  fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.get(self.generation.as_str(), key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(key = %key.description(), error = %e, "cache lookup failed");
        None
      }
    }
  }

  fn write_back(&self, key: &RequestKey, response: &Response) {
    match self.storage.put(self.generation.as_str(), key, response) {
      Ok(()) => debug!(key = %key.description(), generation = %self.generation, "stored"),
      Err(e) => warn!(key = %key.description(), error = %e, "write-back failed"),
    }
  }

  fn fallback(&self, navigation: bool) -> Served {
    if navigation {
      if let Some(shell) = self.lookup(&RequestKey::new(&Method::GET, &self.root)) {
        return Served::new(shell.response, ResponseSource::NavigationFallback);
      }
    }
    Served::new(Response::unavailable(), ResponseSource::Unavailable)
  }
}

impl<S: CacheStorage, N: Network> Clone for InterceptionPolicy<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      classifier: self.classifier.clone(),
      generation: self.generation.clone(),
      root: self.root.clone(),
      timeout: self.timeout,
    }
  }
}
