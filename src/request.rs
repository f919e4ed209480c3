//! Request and response types passed between the page, the policy and the network.

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use url::Url;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  SameOrigin,
  #[default]
  Cors,
  NoCors,
}

/// An outgoing request as seen by the interception layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub url: Url,
  pub method: Method,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl Request {
  /// A plain GET subresource request.
  pub fn get(url: Url) -> Self {
    Self {
      url,
      method: Method::GET,
      headers: Vec::new(),
      body: None,
      mode: RequestMode::default(),
    }
  }

  /// A page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// Where a response came from, in fetch terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin network response
  Basic,
  /// Cross-origin network response
  Cors,
  Opaque,
  Error,
  /// Constructed locally, never seen on the wire
  Default,
}

/// A response, either from the network, from storage or synthesized.
///
/// The body is kept out of the serialized head so storage can persist it as a
/// raw blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub response_type: ResponseType,
  /// Final URL after redirects (empty for synthetic responses)
  pub url: String,
  pub redirected: bool,
  pub headers: Vec<(String, String)>,
  #[serde(skip)]
  pub body: Vec<u8>,
}

impl Response {
  /// A same-origin response with the canonical reason phrase for `status`.
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: reason_phrase(status).to_string(),
      response_type: ResponseType::Basic,
      url: String::new(),
      redirected: false,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Plain-text 503 returned when a cacheable request cannot be served at all.
  pub fn unavailable() -> Self {
    Self {
      response_type: ResponseType::Default,
      headers: vec![("content-type".into(), "text/plain".into())],
      ..Self::new(503, "Service Unavailable")
    }
  }

  /// JSON error in the `{result, msg}` shape the sync endpoint itself uses,
  /// for callers that bound bypass requests with a timeout.
  pub fn sync_failure(msg: &str) -> Self {
    let body = serde_json::json!({ "result": "error", "msg": msg });
    Self {
      response_type: ResponseType::Default,
      headers: vec![("content-type".into(), "application/json".into())],
      ..Self::new(504, body.to_string())
    }
  }

  #[cfg(test)]
  pub fn with_type(mut self, response_type: ResponseType) -> Self {
    self.response_type = response_type;
    self
  }

  #[cfg(test)]
  pub fn with_url(mut self, url: impl Into<String>) -> Self {
    self.url = url.into();
    self
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Complete, same-origin 200: the only kind of network response worth storing.
  pub fn is_storable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

fn reason_phrase(status: u16) -> &'static str {
  StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}
