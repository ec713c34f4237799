//! keyrelay batch runner
//!
//! Reads JSONL prompts, sends each through the retrying invoker against a
//! rotating credential pool with bounded concurrency and global pacing, and
//! writes one JSONL result per input line in input order.

mod batch;
mod config;
mod error;
mod metrics;
mod status;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use completion::ChatClient;
use dispatch::{RateLimitedWorkPool, RetryingInvoker};
use key_pool::CredentialPool;

use crate::batch::{BatchContext, RunProgress};
use crate::config::Config;
use crate::status::AppState;

/// Parsed command line.
#[derive(Debug, PartialEq, Eq)]
struct CliArgs {
    config: Option<String>,
    input: PathBuf,
    output: PathBuf,
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// `--config <toml>` is optional; `--input` and `--output` are required.
fn parse_args(args: &[String]) -> Result<CliArgs> {
    let input = flag_value(args, "--input").context("missing required --input <jsonl>")?;
    let output = flag_value(args, "--output").context("missing required --output <jsonl>")?;
    Ok(CliArgs {
        config: flag_value(args, "--config").map(str::to_owned),
        input: PathBuf::from(input),
        output: PathBuf::from(output),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let run_id = format!("run_{}", uuid::Uuid::new_v4().as_simple());
    let span = info_span!("batch", run_id = %run_id);
    run().instrument(span).await
}

async fn run() -> Result<()> {
    info!("starting keyrelay-batch");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args)?;

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        owner = %config.credentials.owner,
        source = ?config.credentials.source,
        endpoint = %config.completion.endpoint,
        concurrency = config.dispatch.concurrency,
        min_spacing_ms = config.dispatch.min_spacing_ms,
        "configuration loaded"
    );

    // Credentials
    let pool = Arc::new(CredentialPool::new());
    let source = config
        .credentials
        .build_source()
        .context("failed to build credential source")?;
    let loaded = pool
        .load(&config.credentials.owner, source.as_ref())
        .await
        .context("failed to load credentials")?;
    if loaded == 0 {
        anyhow::bail!(
            "no usable credentials for owner {}",
            config.credentials.owner
        );
    }

    // Input
    let contents = tokio::fs::read_to_string(&cli.input)
        .await
        .with_context(|| format!("failed to read input {}", cli.input.display()))?;
    let items = batch::parse_items(&contents)
        .with_context(|| format!("invalid input {}", cli.input.display()))?;
    metrics::set_input_items(items.len());
    info!(items = items.len(), credentials = loaded, "batch input loaded");

    let client = ChatClient::new(
        config.completion.endpoint.as_str(),
        config.completion.model.as_str(),
        Duration::from_secs(config.completion.timeout_secs),
    )
    .context("failed to build completion client")?;
    // Each item attaches its own rotator, see BatchContext::process
    let invoker = RetryingInvoker::new(config.retry.clone());
    info!(
        model = client.model(),
        max_retries = invoker.policy().max_retries,
        initial_delay_ms = invoker.policy().initial_delay_ms,
        "completion client ready"
    );

    // A stop request lets in-flight items finish and skips the rest
    let stop = Arc::new(AtomicBool::new(false));
    let signal_task = {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("stop requested, remaining items will be skipped");
            stop.store(true, Ordering::Relaxed);
        })
    };

    let progress = Arc::new(RunProgress::new(items.len()));

    // Optional status endpoint, drained once the batch finishes
    let status_server = match &config.status {
        Some(status_config) => {
            let app = status::build_router(AppState {
                pool: pool.clone(),
                progress: progress.clone(),
                prometheus: prometheus_handle,
            });
            let listener = TcpListener::bind(status_config.listen_addr)
                .await
                .with_context(|| format!("failed to bind to {}", status_config.listen_addr))?;
            info!(addr = %status_config.listen_addr, "status endpoint listening");

            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    })
                    .await
            });
            Some((shutdown_tx, handle))
        }
        None => None,
    };

    let ctx = BatchContext::new(pool.clone(), client, invoker, stop, progress, &items);
    let work_pool =
        RateLimitedWorkPool::new(config.dispatch.concurrency, config.dispatch.min_spacing());
    let summary = work_pool
        .run(items.into_iter().enumerate(), |(index, item)| {
            ctx.process(index, item)
        })
        .await;

    let results = ctx.into_results();
    let rendered = batch::render_results(&results).context("failed to render results")?;
    tokio::fs::write(&cli.output, rendered)
        .await
        .with_context(|| format!("failed to write output {}", cli.output.display()))?;

    let pool_status = pool.status().await;
    info!(
        output = %cli.output.display(),
        dispatched = summary.dispatched,
        completed = summary.completed,
        failed = summary.failed,
        failed_credentials = pool_status.failed_count,
        "batch finished"
    );

    signal_task.abort();

    if let Some((shutdown_tx, handle)) = status_server {
        let _ = shutdown_tx.send(());
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "status server error during shutdown"),
            Err(e) => error!(error = %e, "status server task panicked"),
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
