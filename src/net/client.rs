use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use url::{Origin, Url};

use super::{NetError, Network};
use crate::request::{Request, Response, ResponseType};

/// HTTP client for the application origin.
///
/// Responses whose final URL shares the scope's origin are `Basic`, anything
/// else is `Cors`. No client-level timeout is set.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpNetwork {
  pub fn new(scope: &Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offline-shell/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: scope.origin(),
    })
  }

  async fn execute(&self, request: Request) -> Result<Response, NetError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await.map_err(to_net_error)?;

    let status = response.status();
    let final_url = response.url().clone();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| NetError::Body(e.to_string()))?;

    let response_type = if final_url.origin() == self.origin {
      ResponseType::Basic
    } else {
      ResponseType::Cors
    };

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      response_type,
      redirected: final_url != request.url,
      url: final_url.into(),
      headers,
      body: body.to_vec(),
    })
  }
}

impl Network for HttpNetwork {
  fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
    Box::pin(self.execute(request))
  }
}

fn to_net_error(err: reqwest::Error) -> NetError {
  if err.is_connect() {
    NetError::Connect(err.to_string())
  } else {
    NetError::Request(err.to_string())
  }
}
