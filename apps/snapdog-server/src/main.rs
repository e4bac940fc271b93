//! SnapDog Server - standalone binary wrapping `snapdog-core`.
//!
//! Loads configuration, runs the composition root's bring-up, and decides
//! the process exit code from the returned [`StartupOutcome`] — the core
//! itself never calls `std::process::exit` (SPEC_FULL.md §4.11).

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use snapdog_core::knx::{DptCodec, DptValue};
use snapdog_core::{bootstrap, StartupOutcome};
use tokio::signal;

use crate::config::ServerConfig;

/// SnapDog Server - headless Snapcast/MQTT/KNX integration hub.
#[derive(Parser, Debug)]
#[command(name = "snapdog-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE", env = "SNAPDOG_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "SNAPDOG_LOG_LEVEL")]
    log_level: String,

    /// Base MQTT topic (overrides config file).
    #[arg(short, long, env = "SNAPDOG_BASE_TOPIC")]
    base_topic: Option<String>,
}

/// Placeholder DPT codec: the real table-driven encode/decode implementation
/// is an external collaborator (SPEC_FULL.md §6) this binary does not own.
/// Swap in a real codec crate before deploying against a live KNX gateway.
struct PassthroughDptCodec;

impl DptCodec for PassthroughDptCodec {
    fn decode(&self, dpt: &str, bytes: &[u8]) -> Option<DptValue> {
        match dpt {
            "1.001" => bytes.first().map(|b| DptValue::Bool(*b != 0)),
            "5.001" => bytes.first().map(|b| DptValue::Scaled(*b)),
            _ => Some(DptValue::Raw(bytes.to_vec())),
        }
    }

    fn encode(&self, _dpt: &str, value: &DptValue) -> Vec<u8> {
        match value {
            DptValue::Bool(b) => vec![u8::from(*b)],
            DptValue::Scaled(v) => vec![*v],
            DptValue::Raw(bytes) => bytes.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "snapdog-server starting");

    let mut server_config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(base_topic) = args.base_topic {
        server_config.base_topic = base_topic;
    }

    let core_config = server_config.to_core_config();
    let codec: Arc<dyn DptCodec> = Arc::new(PassthroughDptCodec);

    let (services, outcome) = bootstrap(&core_config, codec)
        .await
        .context("failed to bootstrap snapdog-core services")?;

    match &outcome {
        StartupOutcome::Ready => tracing::info!("startup complete, all integrations connected"),
        StartupOutcome::Degraded { disabled } => {
            tracing::warn!(?disabled, "startup complete in degraded mode");
        }
        StartupOutcome::Terminate { reason } => {
            tracing::error!(reason, "critical integration failed to start, exiting");
            services.cancel.cancel();
            std::process::exit(1);
        }
    }

    snapdog_core::startup::publish_initial_state(&services.zones, &services.clients).await;

    shutdown_signal().await;
    tracing::info!("shutdown signal received, cancelling background tasks");
    services.cancel.cancel();

    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
