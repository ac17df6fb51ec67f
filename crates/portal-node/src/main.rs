//! Portal node binary: runs either the proxy or a backend server.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI
//! flags, e.g. `portal-node --role proxy --bind 0.0.0.0:25590` or
//! `portal-node --role server --name survival --proxy 10.0.0.1:25590`.

mod error;
mod roles;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use portal_config::{CliArgs, Config, NodeRole};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("portal-node"))
            .unwrap_or_else(|| PathBuf::from("."))
    });

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    portal_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        return ExitCode::FAILURE;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for interrupts: {e}");
            return std::future::pending().await;
        }
        tracing::info!("Interrupt received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Starting '{}' as {:?}", config.node.name, config.node.role);
    let result = match config.node.role {
        NodeRole::Proxy => roles::run_proxy(&config, shutdown_rx).await,
        NodeRole::Server => roles::run_server(&config, shutdown_rx).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
