//! LatentContext sidecar - per-user memory for conversational assistants.
//!
//! Runs as a subprocess speaking line-delimited JSON-RPC on stdin/stdout.
//! All logging goes to stderr; stdout carries only protocol frames.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use latent_context::config::EngineConfig;
use latent_context::engine::Engine;
use latent_context::rpc;

#[derive(Parser)]
#[command(name = "latent-context")]
#[command(about = "Memory sidecar: tiered notes, hybrid retrieval, budgeted context assembly")]
#[command(version)]
struct Cli {
    /// Directory for the durable store (overrides LATENT_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Embedding provider: local or none (overrides LATENT_EMBEDDING_PROVIDER)
    #[arg(long)]
    embedding_provider: Option<String>,

    /// Disable cross-session retrieval (strict session isolation)
    #[arg(long)]
    session_isolated: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // stdout is the wire; logs go to stderr
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("latent_context=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(provider) = cli.embedding_provider {
        config.embedding.provider = provider;
    }
    if cli.session_isolated {
        config.retrieval.cross_session = false;
    }
    config.log();

    let engine = match Engine::boot(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            tracing::error!("Engine failed to boot: {e:#}");
            std::process::exit(1);
        }
    };

    if engine.config().session.auto_start_on_boot {
        match engine.session_start() {
            Ok(result) => info!(
                "Auto-started session {}",
                result["new_id"].as_str().unwrap_or("?")
            ),
            Err(e) => tracing::warn!("Auto session start failed: {e}"),
        }
    }

    info!("Serving line-delimited JSON-RPC on stdio");

    tokio::select! {
        result = rpc::serve(Arc::clone(&engine)) => {
            if let Err(e) = result {
                tracing::error!("Transport error: {e:#}");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    engine.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
