//! # opsync
//!
//! Offline-first task list that syncs through an opsync server.
//!
//! ## Commands
//!
//! - `init`: Bind this device to a server and account
//! - `add`, `done`, `remove`, `list`: Edit tasks locally (works offline)
//! - `sync`: Upload pending edits and download everyone else's
//! - `status`: Show local (and optionally server) sync state
//! - `compact`, `restore-points`: Server history maintenance
//! - `rotate-password`: Re-encrypt the account under a new password
//!
//! ## Example
//!
//! ```bash
//! opsync init --server http://localhost:8080 --user alice
//! opsync add "Buy milk"
//! opsync sync
//!
//! # On another device
//! opsync init --server http://localhost:8080 --user alice
//! opsync sync
//! opsync list
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::init::KeySource;
use commands::{init, rotate, status, sync, tasks};

/// Offline-first task list that syncs through an opsync server.
#[derive(Parser, Debug)]
#[command(name = "opsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the device configuration and sync state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bind this device to a server and account
    Init {
        /// Server base URL
        #[arg(long, short)]
        server: String,

        /// Account id
        #[arg(long, short)]
        user: String,

        /// Account password (will prompt if not provided)
        #[arg(long, short, conflicts_with = "no_encryption")]
        password: Option<String>,

        /// Store payloads unencrypted
        #[arg(long)]
        no_encryption: bool,
    },

    /// Add a task
    Add {
        /// Task title
        title: String,

        /// Make it a subtask of this task (id or id prefix)
        #[arg(long)]
        parent: Option<String>,
    },

    /// Mark a task as done
    Done {
        /// Task id or id prefix
        id: String,
    },

    /// Remove a task and its subtasks
    Remove {
        /// Task id or id prefix
        id: String,
    },

    /// List tasks
    List,

    /// Upload pending edits and download remote ones
    Sync,

    /// Show sync status
    Status {
        /// Also ask the server for its view of the account
        #[arg(long)]
        remote: bool,
    },

    /// Drop server history made redundant by restore points
    Compact,

    /// List restore points on the server
    RestorePoints {
        /// Maximum entries to show
        #[arg(long, default_value = "30")]
        limit: u32,
    },

    /// Change the account password and re-encrypt server data
    RotatePassword {
        /// New password (will prompt if not provided)
        #[arg(long, short)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    config::ensure_data_dir(&data_dir).await?;

    match cli.command {
        Commands::Init {
            server,
            user,
            password,
            no_encryption,
        } => {
            let key_source = match (password, no_encryption) {
                (_, true) => KeySource::None,
                (Some(password), false) => KeySource::Password(password),
                (None, false) => KeySource::Prompt,
            };
            init::run(&data_dir, &server, &user, key_source).await?;
        }
        Commands::Add { title, parent } => {
            tasks::add(&data_dir, &title, parent.as_deref()).await?;
        }
        Commands::Done { id } => {
            tasks::done(&data_dir, &id).await?;
        }
        Commands::Remove { id } => {
            tasks::remove(&data_dir, &id).await?;
        }
        Commands::List => {
            tasks::list(&data_dir).await?;
        }
        Commands::Sync => {
            sync::run(&data_dir).await?;
        }
        Commands::Status { remote } => {
            status::run(&data_dir, remote).await?;
        }
        Commands::Compact => {
            sync::compact(&data_dir).await?;
        }
        Commands::RestorePoints { limit } => {
            sync::restore_points(&data_dir, limit).await?;
        }
        Commands::RotatePassword { password } => {
            rotate::run(&data_dir, password).await?;
        }
    }

    Ok(())
}

/// Get the default data directory for opsync.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "opsync", "opsync")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
