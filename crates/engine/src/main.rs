//! `booth-engine` -- run one batch of generation jobs from the command line.
//!
//! Reads a JSON array of job specs, submits them as one batch against
//! the remote provider, and prints the batch result as JSON on stdout.
//!
//! ```text
//! booth-engine jobs.json
//! booth-engine - < jobs.json
//! ```
//!
//! # Environment variables
//!
//! | Variable     | Required | Default              | Description                  |
//! |--------------|----------|----------------------|------------------------------|
//! | `RUST_LOG`   | no       | `booth_engine=info`  | Log filter                   |
//! | `LOG_FORMAT` | no       | `text`               | `json` for structured logs   |
//!
//! Provider settings are read by [`ProviderConfig::from_env`], engine
//! settings by [`EngineConfig::from_env`].

use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use booth_core::job::JobSpec;
use booth_engine::cancel::{CancelRateLimiter, JsonFileStore, SystemClock};
use booth_engine::observer::TracingObserver;
use booth_engine::{EngineConfig, JobOrchestrator};
use booth_provider::config::ProviderConfig;
use booth_provider::remote::RemoteProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let path = std::env::args()
        .nth(1)
        .context("usage: booth-engine <jobs.json | ->")?;
    let specs = read_specs(&path)?;

    let engine_config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let provider_config = ProviderConfig::from_env().context("Invalid provider configuration")?;
    tracing::info!(
        api_url = %provider_config.api_url,
        jobs = specs.len(),
        completion_mode = ?engine_config.completion_mode,
        "Starting booth-engine",
    );

    let limiter = Arc::new(match &engine_config.cancel_state_path {
        Some(path) => CancelRateLimiter::new(
            engine_config.cancel_cooldown,
            Arc::new(SystemClock),
            Arc::new(JsonFileStore::new(path)),
        ),
        None => CancelRateLimiter::in_memory(engine_config.cancel_cooldown),
    });

    let provider = RemoteProvider::start(provider_config).context("Failed to start provider")?;
    let orchestrator = JobOrchestrator::new(provider.clone(), limiter, engine_config);

    let batch = orchestrator
        .submit_batch(specs, Arc::new(TracingObserver))
        .context("Batch rejected")?;

    let outcome = tokio::select! {
        result = batch.wait() => Some(result),
        () = shutdown_signal() => None,
    };

    let result = match outcome {
        Some(result) => result.context("Batch ended without a result")?,
        None => {
            for index in batch.indices().collect::<Vec<_>>() {
                match batch.cancel(index).await {
                    Ok(receipt) => tracing::info!(index, refund = receipt.refund.percent, "Canceled on shutdown"),
                    Err(e) => tracing::debug!(index, error = %e, "Not canceled on shutdown"),
                }
            }
            provider.shutdown().await;
            anyhow::bail!("Interrupted before the batch completed");
        }
    };

    provider.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        std::process::exit(2);
    }
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "booth_engine=info,booth_provider=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn read_specs(path: &str) -> anyhow::Result<Vec<JobSpec>> {
    let raw = if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read job specs from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?
    };
    serde_json::from_str(&raw).context("Job specs must be a JSON array of job objects")
}

/// Wait for SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
