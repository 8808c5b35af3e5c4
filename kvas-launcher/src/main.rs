//! kvas-launcher binary entry point.
//!
//! Usage:
//! ```bash
//! SSH_LOGIN=kvas SSH_FILE=~/.ssh/kvas kvas-launcher --config kvas.toml
//! kvas-launcher --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use kvas_launcher::http::{self, health};
use kvas_launcher::{Config, Launcher};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Load-test task launcher.
#[derive(Parser, Debug)]
#[command(name = "kvas-launcher")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file; built-in defaults are used if it does not exist
    #[arg(long, default_value = "kvas.toml")]
    config: PathBuf,

    /// Override the HTTP bind address
    #[arg(long)]
    bind: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        tracing::info!(path = %args.config.display(), "no config file, using defaults");
        Config::default()
    };
    config.apply_env();
    if let Some(bind) = &args.bind {
        config.server.bind_address = bind.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let launcher = Arc::new(Launcher::from_config(&config).context("failed to start launcher")?);

    health::init_start_time();
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;
    tracing::info!(
        address = %config.server.bind_address,
        version = env!("CARGO_PKG_VERSION"),
        "kvas-launcher listening"
    );

    let served = axum::serve(listener, http::build_router(Arc::clone(&launcher)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    // Runs hold cloud instances; release them before the runtime goes away.
    launcher.shutdown().await;
    tracing::info!("all task machines released");
    served
}
