//! Request classification: which requests the cache may touch at all.

use reqwest::Method;

use crate::request::Request;

/// Hosts of the live synchronization service and its redirect host.
pub const DEFAULT_BYPASS_HOSTS: &[&str] = &["script.google.com", "script.googleusercontent.com"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
  /// Live synchronization endpoint
  LiveEndpoint,
  /// Anything but GET
  UnsafeMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Straight to the network: no cache, no timeout
  Bypass(BypassReason),
  /// Subject to cache-first with timeout
  Cacheable,
}

/// Decides per request whether the interception policy applies.
#[derive(Debug, Clone)]
pub struct Classifier {
  bypass_hosts: Vec<String>,
}

impl Default for Classifier {
  fn default() -> Self {
    Self::new(DEFAULT_BYPASS_HOSTS.iter().map(|h| h.to_string()))
  }
}

impl Classifier {
  pub fn new(bypass_hosts: impl IntoIterator<Item = String>) -> Self {
    Self {
      bypass_hosts: bypass_hosts
        .into_iter()
        .map(|h| h.to_lowercase())
        .filter(|h| !h.is_empty())
        .collect(),
    }
  }

  pub fn classify(&self, request: &Request) -> Classification {
    // Host names are already lowercased by URL parsing
    let live = request
      .url
      .host_str()
      .is_some_and(|host| self.bypass_hosts.iter().any(|b| host.contains(b.as_str())));

    if live {
      Classification::Bypass(BypassReason::LiveEndpoint)
    } else if request.method != Method::GET {
      Classification::Bypass(BypassReason::UnsafeMethod)
    } else {
      Classification::Cacheable
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_sync_host_is_bypassed_for_any_method() {
    let classifier = Classifier::default();
    let url = "https://script.google.com/macros/s/abc/exec";

    assert_eq!(
      classifier.classify(&get(url)),
      Classification::Bypass(BypassReason::LiveEndpoint)
    );
    assert_eq!(
      classifier.classify(&get(url).with_method(Method::POST)),
      Classification::Bypass(BypassReason::LiveEndpoint)
    );
  }

  #[test]
  fn test_redirect_host_is_bypassed() {
    let classifier = Classifier::default();
    let request = get("https://script.googleusercontent.com/macros/echo?user_content_key=x");

    assert_eq!(
      classifier.classify(&request),
      Classification::Bypass(BypassReason::LiveEndpoint)
    );
  }

  #[test]
  fn test_non_get_is_bypassed() {
    let classifier = Classifier::default();
    for method in [Method::POST, Method::PUT, Method::DELETE, Method::HEAD] {
      let request = get("http://localhost:8080/data.json").with_method(method);
      assert_eq!(
        classifier.classify(&request),
        Classification::Bypass(BypassReason::UnsafeMethod)
      );
    }
  }

  #[test]
  fn test_plain_get_is_cacheable() {
    let classifier = Classifier::default();
    assert_eq!(
      classifier.classify(&get("http://localhost:8080/index.html")),
      Classification::Cacheable
    );
    assert_eq!(
      classifier.classify(&get("https://cdn.example.com/lib.js")),
      Classification::Cacheable
    );
  }

  #[test]
  fn test_hostless_url_falls_through() {
    let classifier = Classifier::default();
    assert_eq!(
      classifier.classify(&get("data:text/plain,hello")),
      Classification::Cacheable
    );
  }

  #[test]
  fn test_configured_hosts_are_case_insensitive() {
    let classifier = Classifier::new(vec!["API.Example.com".to_string(), String::new()]);
    assert_eq!(
      classifier.classify(&get("https://api.example.com/v1")),
      Classification::Bypass(BypassReason::LiveEndpoint)
    );
    assert_eq!(
      classifier.classify(&get("http://localhost/")),
      Classification::Cacheable
    );
  }
}
