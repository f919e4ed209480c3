mod cache;
mod classify;
mod config;
mod generation;
mod lifecycle;
mod logging;
mod net;
mod policy;
mod request;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::lifecycle::LifecycleManager;
use crate::net::HttpNetwork;
use crate::policy::InterceptionPolicy;
use crate::request::Request;
use crate::worker::{Worker, WorkerHandle};

#[derive(Parser, Debug)]
#[command(name = "offline-shell")]
#[command(about = "Offline-first request interception for the logbook app shell")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-shell/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache generation to run as (overrides the config file)
  #[arg(short, long)]
  generation: Option<String>,

  /// Enable debug logging
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Seed the current generation's store with the app shell
  Install,
  /// Install, then delete every other generation's store
  Activate,
  /// Send requests through the worker
  Fetch {
    /// Absolute URLs, or paths relative to the scope
    #[arg(required = true)]
    urls: Vec<String>,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header, as "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Treat requests as page navigations
    #[arg(long)]
    navigate: bool,

    /// Print response bodies
    #[arg(long)]
    body: bool,
  },
  /// List stored generations
  Stores,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override generation if specified on command line
  let config = if let Some(generation) = args.generation {
    Config {
      generation,
      ..config
    }
  } else {
    config
  };
  config.validate()?;

  let _log_guard = logging::init(config.log_file.as_deref(), args.verbose)?;

  let db_path = config.database_path()?;
  let storage = Arc::new(SqliteStorage::open(&db_path)?);

  match args.command {
    Command::Install => {
      let worker = spawn_worker(&config, Arc::clone(&storage))?;
      worker.install().await?;
      println!(
        "installed {} ({} entries)",
        config.generation,
        storage.len(&config.generation)?
      );
    }
    Command::Activate => {
      let worker = spawn_worker(&config, Arc::clone(&storage))?;
      worker.install().await?;
      let deleted = worker.activate().await?;
      println!("activated {}", config.generation);
      for name in deleted {
        println!("deleted {}", name);
      }
    }
    Command::Fetch {
      urls,
      method,
      headers,
      data,
      navigate,
      body,
    } => {
      let worker = spawn_worker(&config, Arc::clone(&storage))?;
      worker.start().await?;
      info!(state = %worker.state(), "worker ready");
      let template = RequestTemplate {
        method: &method,
        headers: &headers,
        data: data.as_deref(),
        navigate,
      };
      fetch_all(&worker, &config, &urls, &template, body).await?;
    }
    Command::Stores => list_stores(storage.as_ref(), &config)?,
  }

  Ok(())
}

fn spawn_worker(config: &Config, storage: Arc<SqliteStorage>) -> Result<WorkerHandle> {
  let scope = config.scope_url()?;
  let generation = config.generation();
  let network = Arc::new(HttpNetwork::new(&scope)?);

  let lifecycle = LifecycleManager::new(
    Arc::clone(&storage),
    Arc::clone(&network),
    generation.clone(),
    config.precache_urls()?,
  )
  .with_install_timeout(config.install_timeout());

  let policy = InterceptionPolicy::new(storage, Arc::clone(&network), generation, scope)
    .with_classifier(config.classifier())
    .with_timeout(config.fetch_timeout());

  info!(generation = %config.generation, scope = %config.scope, "worker starting");

  Ok(
    Worker::new(lifecycle, policy, network)
      .with_bypass_timeout(config.bypass_timeout())
      .spawn(),
  )
}

/// Command-line shape shared by every request of one `fetch` invocation.
struct RequestTemplate<'a> {
  method: &'a str,
  headers: &'a [String],
  data: Option<&'a str>,
  navigate: bool,
}

impl RequestTemplate<'_> {
  fn build(&self, url: url::Url) -> Result<Request> {
    let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| eyre!("Invalid method '{}': {}", self.method, e))?;

    let mut request = if self.navigate {
      Request::navigate(url)
    } else {
      Request::get(url)
    }
    .with_method(method);

    for raw in self.headers {
      let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", raw))?;
      request = request.with_header(name.trim(), value.trim());
    }
    if let Some(data) = self.data {
      request = request.with_body(data);
    }
    Ok(request)
  }
}

async fn fetch_all(
  worker: &WorkerHandle,
  config: &Config,
  urls: &[String],
  template: &RequestTemplate<'_>,
  show_body: bool,
) -> Result<()> {
  let scope = config.scope_url()?;

  let mut requests = Vec::with_capacity(urls.len());
  for raw in urls {
    let url = scope
      .join(raw)
      .map_err(|e| eyre!("Invalid URL '{}': {}", raw, e))?;
    requests.push(template.build(url)?);
  }

  let labels: Vec<String> = requests.iter().map(|r| r.url.to_string()).collect();
  let replies = join_all(requests.into_iter().map(|r| worker.fetch(r))).await;

  let mut failures = 0;
  for (url, reply) in labels.iter().zip(replies) {
    match reply {
      Ok(served) => {
        println!("{} {} {}", served.response.status, served.source, url);
        if show_body {
          println!("{}", served.response.text());
        }
      }
      Err(err) => {
        failures += 1;
        println!("error {}: {}", url, err);
      }
    }
  }

  if failures > 0 {
    return Err(eyre!("{} request(s) failed", failures));
  }
  Ok(())
}

fn list_stores(storage: &SqliteStorage, config: &Config) -> Result<()> {
  let current = config.generation();
  for name in storage.names()? {
    let marker = if current.owns(&name) { "*" } else { " " };
    println!("{} {} ({} entries)", marker, name, storage.len(&name)?);
  }
  Ok(())
}
