//! KeySync CLI
//!
//! Command-line client for a KeySync store whose remote is a shared
//! directory.
//!
//! # Commands
//!
//! - `put` - Write a JSON value locally
//! - `get` - Read a value, falling back to the remote
//! - `rm` - Remove keys locally and remotely
//! - `sync` - Reconcile keys with the remote
//! - `status` - Show keys waiting for sync

mod commands;
mod dir_transport;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// KeySync command-line client.
#[derive(Parser)]
#[command(name = "keysync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to this device's local store
    #[arg(global = true, short, long, env = "KEYSYNC_LOCAL")]
    local: Option<PathBuf>,

    /// Path to the shared remote directory
    #[arg(global = true, short, long, env = "KEYSYNC_REMOTE")]
    remote: Option<PathBuf>,

    /// Passphrase for value encryption (values are stored in the clear without one)
    #[arg(global = true, long, env = "KEYSYNC_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a JSON value locally
    Put {
        /// Entity key
        key: String,

        /// Value as JSON
        value: String,

        /// Sync the key right away
        #[arg(short, long)]
        sync: bool,
    },

    /// Read a value
    Get {
        /// Entity key
        key: String,

        /// Never contact the remote
        #[arg(long)]
        local_only: bool,
    },

    /// Remove keys locally and remotely
    Rm {
        /// Keys to remove
        #[arg(required = true)]
        keys: Vec<String>,

        /// Remove locally only, leaving the remote copy
        #[arg(long)]
        force: bool,
    },

    /// Reconcile keys with the remote (all unsynced keys if none given)
    Sync {
        /// Keys to reconcile
        keys: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show keys waiting for sync
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Version = cli.command {
        println!("KeySync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let local = cli.local.ok_or("local store path required (--local)")?;
    let remote = cli.remote.ok_or("remote directory required (--remote)")?;
    let store = commands::open_store(&local, &remote, cli.passphrase.as_deref())?;

    let outcome = match cli.command {
        Commands::Put { key, value, sync } => commands::put::run(&store, &key, &value, sync).await,
        Commands::Get { key, local_only } => commands::get::run(&store, &key, local_only).await,
        Commands::Rm { keys, force } => commands::remove::run(&store, &keys, force).await,
        Commands::Sync { keys, format } => commands::sync::run(&store, keys, &format).await,
        Commands::Status { format } => commands::status::run(&store, &format),
        Commands::Version => Ok(()),
    };

    store.close().await;
    outcome
}
