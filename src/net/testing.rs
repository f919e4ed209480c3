//! Scripted network for tests.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{NetError, Network};
use crate::request::{Request, Response};

/// What the fake server does for one URL.
#[derive(Debug, Clone)]
pub enum Reply {
  Respond(Response),
  Delayed(Duration, Response),
  Fail(NetError),
  /// Accepts the request and never answers (fake wifi)
  Hang,
}

/// Replies per absolute URL; unknown URLs fail to connect.
#[derive(Default)]
pub struct ScriptedNetwork {
  replies: HashMap<String, Reply>,
  calls: Mutex<Vec<Request>>,
  in_flight: Arc<AtomicUsize>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn reply(mut self, url: &str, reply: Reply) -> Self {
    self.replies.insert(url.to_string(), reply);
    self
  }

  /// Every request seen so far, in arrival order.
  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Requests started but neither finished nor dropped.
  pub fn in_flight(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }
}

struct InFlight(Arc<AtomicUsize>);

impl InFlight {
  fn start(counter: &Arc<AtomicUsize>) -> Self {
    counter.fetch_add(1, Ordering::SeqCst);
    Self(Arc::clone(counter))
  }
}

impl Drop for InFlight {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl Network for ScriptedNetwork {
  fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
    self.calls.lock().unwrap().push(request.clone());
    let reply = self.replies.get(request.url.as_str()).cloned();
    let counter = Arc::clone(&self.in_flight);

    Box::pin(async move {
      let _guard = InFlight::start(&counter);
      match reply {
        Some(Reply::Respond(response)) => Ok(response),
        Some(Reply::Delayed(delay, response)) => {
          tokio::time::sleep(delay).await;
          Ok(response)
        }
        Some(Reply::Fail(err)) => Err(err),
        Some(Reply::Hang) => futures::future::pending().await,
        None => Err(NetError::Connect(format!("no route to {}", request.url))),
      }
    })
  }
}
