/// Clap argument definitions
mod args;

/// `config` command handlers
mod config;

/// `conflicts`, `resolve`, `compact` and `status`
mod documents;

/// Terminal progress indicator
mod progress;

/// `pull`, `push` and `sync`
mod replicate;

use clap::Parser;
use std::sync::Arc;

use couchsync_core::Datastore;
use couchsync_core::config::ReplicationConfig;

pub use args::Cli;
use args::Commands;

/// Main entry point for the CLI
pub fn run_cli() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = match ReplicationConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Error loading config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(database) = cli.database {
        config.database = database;
    }
    log::debug!("Using database {}", config.database.display());

    let success = match cli.command {
        Commands::Pull { remote } => replicate::handle_pull(&config, remote.as_deref()),
        Commands::Push { remote, create } => {
            replicate::handle_push(&config, remote.as_deref(), create)
        }
        Commands::Sync { remote } => replicate::handle_sync(&config, remote.as_deref()),
        Commands::Conflicts => documents::handle_conflicts(&config),
        Commands::Resolve { id, keep } => documents::handle_resolve(&config, &id, &keep),
        Commands::Compact => documents::handle_compact(&config),
        Commands::Status { remote } => documents::handle_status(&config, remote.as_deref()),
        Commands::Config { command } => config::handle_config_command(command, config),
    };

    if !success {
        std::process::exit(1);
    }
}

/// Open the configured local database, creating its directory if needed.
fn open_datastore(config: &ReplicationConfig) -> Option<Arc<Datastore>> {
    let path = &config.database;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        eprintln!("✗ Could not create {}: {}", parent.display(), e);
        return None;
    }
    match Datastore::open(path) {
        Ok(ds) => Some(Arc::new(ds)),
        Err(e) => {
            eprintln!("✗ Could not open database {}: {}", path.display(), e);
            None
        }
    }
}
