//! opsync-server binary entry point.
//!
//! Usage:
//! ```bash
//! opsync-server --config server.toml
//! opsync-server --bind 127.0.0.1:8080
//! ```

use anyhow::Context;
use clap::Parser;
use opsync_server::cleanup::spawn_cleanup_task;
use opsync_server::http::{build_router, health};
use opsync_server::{Config, SqliteStorage, SyncServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Operation-log sync server.
#[derive(Debug, Parser)]
#[command(name = "opsync-server", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind address from the config file.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override the database path from the config file.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(database) = args.database {
        config.storage.database = database;
    }
    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let storage = if config.storage.database.as_os_str() == ":memory:" {
        SqliteStorage::in_memory().await?
    } else {
        SqliteStorage::new(&config.storage.database).await?
    };
    tracing::info!("Storage ready at {}", config.storage.database.display());

    health::init_start_time();
    let bind_address = config.server.bind_address.clone();
    let cleanup_config = config.cleanup.clone();
    let server = Arc::new(SyncServer::new(config, storage));

    let _cleanup = spawn_cleanup_task(
        server.service_arc(),
        server.rate_limits().clone(),
        cleanup_config,
    );

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    tracing::info!(
        "opsync-server v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        bind_address
    );

    axum::serve(listener, build_router(server))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
