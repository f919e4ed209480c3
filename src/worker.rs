//! Worker event dispatch.
//!
//! Pages and the host talk to the worker by sending [`WorkerEvent`]s over a
//! channel; each event carries a oneshot sender for its reply. Fetch events are
//! handled on their own tasks so a stalled request never holds up the others.
//! Lifecycle events are serialized through the lifecycle lock.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::lifecycle::{LifecycleManager, WorkerState};
use crate::net::{fetch_bounded, NetError, Network};
use crate::policy::{Disposition, InterceptionPolicy, ResponseSource, Served};
use crate::request::{Request, Response};

/// What the page ultimately gets for a fetch: a response, or for bypass
/// requests whatever network error occurred.
pub type FetchReply = Result<Served, NetError>;

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  /// Resume or install + activate
  Start { done: oneshot::Sender<Result<()>> },
  Install { done: oneshot::Sender<Result<()>> },
  Activate {
    done: oneshot::Sender<Result<Vec<String>>>,
  },
  Fetch {
    request: Request,
    respond_to: oneshot::Sender<FetchReply>,
  },
}

pub struct Worker<S: CacheStorage, N: Network> {
  lifecycle: Arc<Mutex<LifecycleManager<S, N>>>,
  state: watch::Receiver<WorkerState>,
  policy: InterceptionPolicy<S, N>,
  network: Arc<N>,
  /// Optional budget for bypass requests; unset means unbounded
  bypass_timeout: Option<Duration>,
}

impl<S, N> Worker<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  pub fn new(
    lifecycle: LifecycleManager<S, N>,
    policy: InterceptionPolicy<S, N>,
    network: Arc<N>,
  ) -> Self {
    let state = lifecycle.subscribe();
    Self {
      lifecycle: Arc::new(Mutex::new(lifecycle)),
      state,
      policy,
      network,
      bypass_timeout: None,
    }
  }

  pub fn with_bypass_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.bypass_timeout = timeout;
    self
  }

  /// Spawn the dispatch loop and return the handle used to send events.
  pub fn spawn(self) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = self.state.clone();
    tokio::spawn(self.run(rx));
    WorkerHandle { tx, state }
  }

  async fn run(self, mut rx: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = rx.recv().await {
      match event {
        WorkerEvent::Start { done } => {
          let lifecycle = Arc::clone(&self.lifecycle);
          tokio::spawn(async move {
            let _ = done.send(lifecycle.lock().await.start().await);
          });
        }
        WorkerEvent::Install { done } => {
          let lifecycle = Arc::clone(&self.lifecycle);
          tokio::spawn(async move {
            let _ = done.send(lifecycle.lock().await.install().await);
          });
        }
        WorkerEvent::Activate { done } => {
          let lifecycle = Arc::clone(&self.lifecycle);
          tokio::spawn(async move {
            let _ = done.send(lifecycle.lock().await.activate());
          });
        }
        WorkerEvent::Fetch {
          request,
          respond_to,
        } => {
          // Pages are only controlled once activation has claimed them
          let controlling = *self.state.borrow() == WorkerState::Activated;
          let policy = self.policy.clone();
          let network = Arc::clone(&self.network);
          let bypass_timeout = self.bypass_timeout;

          tokio::spawn(async move {
            let reply = if controlling {
              match policy.handle(request).await {
                Disposition::Respond(served) => Ok(served),
                Disposition::Passthrough(request, reason) => {
                  debug!(url = %request.url, ?reason, "forwarding bypass request");
                  pass_through(network.as_ref(), request, bypass_timeout).await
                }
              }
            } else {
              debug!(url = %request.url, "not controlling, forwarding");
              pass_through(network.as_ref(), request, None).await
            };
            let _ = respond_to.send(reply);
          });
        }
      }
    }
  }
}

/// Deliver a request the policy does not own.
///
/// Without a budget, the network result is returned as-is, errors included.
/// With one, a failure becomes the JSON error body the page already understands.
async fn pass_through<N: Network + ?Sized>(
  network: &N,
  request: Request,
  timeout: Option<Duration>,
) -> FetchReply {
  let Some(limit) = timeout else {
    let response = network.send(request).await?;
    return Ok(Served::new(response, ResponseSource::Passthrough));
  };

  let url = request.url.clone();
  let response = match fetch_bounded(network, request, limit).await {
    Ok(response) => response,
    Err(err) => {
      warn!(%url, error = %err, "bypass request failed");
      Response::sync_failure(&err.to_string())
    }
  };
  Ok(Served::new(response, ResponseSource::Passthrough))
}

/// Sending side of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
  pub fn state(&self) -> WorkerState {
    *self.state.borrow()
  }

  pub async fn start(&self) -> Result<()> {
    let (done, rx) = oneshot::channel();
    self.dispatch(WorkerEvent::Start { done })?;
    rx.await.map_err(|_| eyre!("Worker stopped before finishing start"))?
  }

  pub async fn install(&self) -> Result<()> {
    let (done, rx) = oneshot::channel();
    self.dispatch(WorkerEvent::Install { done })?;
    rx.await.map_err(|_| eyre!("Worker stopped before finishing install"))?
  }

  pub async fn activate(&self) -> Result<Vec<String>> {
    let (done, rx) = oneshot::channel();
    self.dispatch(WorkerEvent::Activate { done })?;
    rx.await.map_err(|_| eyre!("Worker stopped before finishing activate"))?
  }

  /// Intercept one request on behalf of a page.
  pub async fn fetch(&self, request: Request) -> FetchReply {
    let (respond_to, rx) = oneshot::channel();
    self
      .dispatch(WorkerEvent::Fetch {
        request,
        respond_to,
      })
      .map_err(|e| NetError::Request(e.to_string()))?;
    rx.await
      .map_err(|_| NetError::Request("worker dropped the request".to_string()))?
  }

  fn dispatch(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker is not running"))
  }
}
