//! Night King
//!
//! Watches a Pub/Sub subscription for preemption notifications and restarts
//! each preempted instance once it has terminated.
//!
//! ## Architecture
//!
//! - **Dispatcher**: Pulls notifications and runs one attempt per message
//! - **Resurrector**: Polls the instance until it can be started (or given up on)
//! - **Clients**: Compute Engine and Pub/Sub REST APIs, metadata-server tokens

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use nightking_agent::auth::{MetadataServerToken, StaticToken, TokenProvider};
use nightking_agent::compute::ComputeClient;
use nightking_agent::config::{Args, Config, LogFormat};
use nightking_agent::pubsub::PubSubClient;
use nightking_agent::{Dispatcher, DispatcherConfig, Resurrector, TokioSleeper};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args(Args::parse())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!("Starting Night King");
    info!(
        project = %config.project,
        subscription = %config.subscription_name,
        policy = ?config.policy,
        "Configuration loaded"
    );

    // Credentials
    let tokens: Arc<dyn TokenProvider> = match &config.access_token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => Arc::new(MetadataServerToken::new(&config)?),
    };
    tokens
        .access_token()
        .await
        .context("Failed to acquire access token")?;

    // Collaborators
    let compute = Arc::new(ComputeClient::new(&config, Arc::clone(&tokens))?);
    let subscription = Arc::new(PubSubClient::new(&config, tokens)?);

    let resurrector = Arc::new(Resurrector::new(
        compute,
        Arc::new(TokioSleeper),
        config.policy.clone(),
    ));
    let dispatcher = Dispatcher::new(
        subscription,
        resurrector,
        DispatcherConfig::from(&config),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut dispatcher_handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut dispatcher_handle => {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher task panicked");
            }
            anyhow::bail!("Dispatcher exited unexpectedly");
        }
    }

    // Signal shutdown to the dispatcher
    let _ = shutdown_tx.send(true);
    if let Err(e) = dispatcher_handle.await {
        error!(error = %e, "Dispatcher task panicked");
    }

    info!("Night King shutdown complete");
    Ok(())
}
