//! Tether CLI - Command line interface for the offline request layer.
//!
//! This tool issues requests through the resilient client and lets you
//! inspect, replay, and abandon the pending mutation queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tether_common::{ApiRequest, HttpMethod};
use tether_storage::FileStore;
use tether_sync::{
    ClientConfig, ConnectivityMonitor, ConnectivityState, RequestOptions, RequestOutcome,
    ResilientClient, TracingNotifier,
};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - Offline-resilient HTTP requests")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to a JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the queue and cache.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Treat the device as offline.
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a request through the resilient client.
    Request {
        /// HTTP method: GET, POST, PUT, PATCH or DELETE.
        method: String,

        /// Absolute URL, or a path resolved against the configured base URL.
        url: String,

        /// JSON request body.
        #[arg(short, long)]
        body: Option<String>,

        /// Extra header as NAME:VALUE (repeatable).
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Bypass the response cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Inspect or replay the pending mutation queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Inspect the response cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending mutations.
    List,
    /// Replay pending mutations once.
    Drain,
    /// Abandon all pending mutations.
    Clear,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show the cached response for a GET URL.
    Show {
        /// Request URL exactly as it was issued.
        url: String,
    },
    /// Remove every cached response.
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a config file with default values.
    Init {
        /// Destination (default: --config or ./tether.json).
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Config {
        action: ConfigAction::Init { path },
    } = &cli.command
    {
        let path = path
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(|| PathBuf::from("tether.json"));
        return cmd_config_init(&path);
    }

    let client = open_client(&cli).await?;

    match cli.command {
        Commands::Request {
            method,
            url,
            body,
            headers,
            no_cache,
        } => cmd_request(&client, &method, &url, body.as_deref(), &headers, no_cache).await,

        Commands::Queue { action } => match action {
            QueueAction::List => cmd_queue_list(&client).await,
            QueueAction::Drain => cmd_queue_drain(&client).await,
            QueueAction::Clear => cmd_queue_clear(&client).await,
        },

        Commands::Cache { action } => match action {
            CacheAction::Show { url } => cmd_cache_show(&client, &url).await,
            CacheAction::Clear => {
                client.cache().clear().await.context("Failed to clear cache")?;
                println!("Cache cleared.");
                Ok(())
            }
        },

        Commands::Config { .. } => Ok(()),
    }
}

/// Default data directory.
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
}

/// Build a client from the CLI flags.
async fn open_client(cli: &Cli) -> Result<ResilientClient> {
    let config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    info!("Using data directory {}", data_dir.display());
    let store = FileStore::new(&data_dir)
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;

    let state = if cli.offline {
        ConnectivityState::Offline
    } else {
        ConnectivityState::Online
    };

    ResilientClient::builder(config, Arc::new(store))
        .monitor(Arc::new(ConnectivityMonitor::with_state(state)))
        .notifier(Arc::new(TracingNotifier))
        .build()
        .await
        .context("Failed to initialize client")
}

/// Parse a NAME:VALUE header argument.
fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Header must look like NAME:VALUE, got {:?}", raw))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Header name cannot be empty");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Build the request from CLI arguments.
fn build_request(
    method: &str,
    url: &str,
    body: Option<&str>,
    headers: &[String],
) -> Result<ApiRequest> {
    let method: HttpMethod = method.parse()?;
    let mut request = ApiRequest::new(method, url);

    for raw in headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }

    if let Some(body) = body {
        let body = serde_json::from_str(body).context("Body must be valid JSON")?;
        request = request.with_body(body);
    }

    Ok(request)
}

/// Render an outcome as JSON.
fn outcome_json(outcome: &RequestOutcome) -> serde_json::Value {
    serde_json::json!({
        "data": outcome.data,
        "status": outcome.status,
        "fromCache": outcome.from_cache,
        "queued": outcome.queued,
        "queueId": outcome.mutation.as_ref().map(|m| m.id),
        "error": outcome.error,
    })
}

/// Issue one request.
async fn cmd_request(
    client: &ResilientClient,
    method: &str,
    url: &str,
    body: Option<&str>,
    headers: &[String],
    no_cache: bool,
) -> Result<()> {
    let request = build_request(method, url, body, headers)?;
    let options = if no_cache {
        RequestOptions::no_cache()
    } else {
        RequestOptions::default()
    };

    let outcome = client
        .request(request, options)
        .await
        .with_context(|| format!("{} {} failed", method.to_uppercase(), url))?;

    println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
    Ok(())
}

/// List pending mutations.
async fn cmd_queue_list(client: &ResilientClient) -> Result<()> {
    let pending = client.queue().pending().await;
    if pending.is_empty() {
        println!("No pending mutations.");
        return Ok(());
    }

    println!("{} pending mutation(s):", pending.len());
    for mutation in pending {
        println!(
            "  #{}  {}  {:<6} {}",
            mutation.id,
            mutation.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
            mutation.method,
            mutation.url
        );
    }
    Ok(())
}

/// Replay pending mutations once.
async fn cmd_queue_drain(client: &ResilientClient) -> Result<()> {
    if !client.monitor().is_online() {
        anyhow::bail!("Cannot drain while offline");
    }

    let report = client.drain().await.context("Drain failed")?;
    println!("Synced: {}", report.succeeded);
    println!("Failed: {}", report.failed.len());
    for mutation in &report.failed {
        println!("  #{}  {} {}", mutation.id, mutation.method, mutation.url);
    }
    Ok(())
}

/// Abandon pending mutations.
async fn cmd_queue_clear(client: &ResilientClient) -> Result<()> {
    let count = client.pending_count().await;
    client.clear_queue().await.context("Failed to clear queue")?;
    println!("Discarded {} pending mutation(s).", count);
    Ok(())
}

/// Show a cached GET response.
async fn cmd_cache_show(client: &ResilientClient, url: &str) -> Result<()> {
    let key = ApiRequest::get(url).signature();
    let Some(entry) = client.cache().get(&key).await else {
        println!("No cached response for {}", url);
        return Ok(());
    };

    let fresh = client.cache().is_fresh(&entry);
    println!("Stored: {}", entry.stored_at.to_rfc3339());
    println!("Fresh:  {}", fresh);
    println!("{}", serde_json::to_string_pretty(&entry.data)?);
    Ok(())
}

/// Write a default config file.
fn cmd_config_init(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    ClientConfig::default()
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
