//! Network calls with an enforced upper time bound.

use std::time::Duration;
use thiserror::Error;

use super::{NetError, Network};
use crate::request::{Request, Response};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("no response within {0:?}")]
  Timeout(Duration),
  #[error(transparent)]
  Network(#[from] NetError),
}

/// Send `request` and wait at most `timeout` for the response.
///
/// The request future and the deadline live in the same scope: when the
/// deadline wins, the request future is dropped, which aborts the in-flight
/// call, and when the request wins the timer is dropped with it.
pub async fn fetch_bounded<N>(
  network: &N,
  request: Request,
  timeout: Duration,
) -> Result<Response, FetchError>
where
  N: Network + ?Sized,
{
  match tokio::time::timeout(timeout, network.send(request)).await {
    Ok(result) => Ok(result?),
    Err(_) => Err(FetchError::Timeout(timeout)),
  }
}
