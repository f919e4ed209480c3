//! Network access.
//!
//! Everything that touches the wire goes through the [`Network`] trait so the
//! interception policy and the lifecycle can be driven by scripted fakes.

mod bounded;
mod client;
#[cfg(test)]
pub mod testing;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::request::{Request, Response};

pub use bounded::fetch_bounded;
pub use client::HttpNetwork;

/// Connection-level failure: nothing usable came back.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetError {
  #[error("connection failed: {0}")]
  Connect(String),
  #[error("request failed: {0}")]
  Request(String),
  #[error("failed to read response body: {0}")]
  Body(String),
}

/// Issues one request and resolves with whatever the server answered.
///
/// Implementations must not interpret status codes and must not impose their
/// own deadline.
pub trait Network: Send + Sync {
  fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}
