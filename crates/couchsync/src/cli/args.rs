//! Command-line argument structures and enums

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "couchsync")]
#[command(version)]
#[command(about = "Replicate a local document datastore with CouchDB-compatible servers", long_about = None)]
pub struct Cli {
    /// Override the local database location
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Log replication progress (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull changes from a remote database into the local one
    Pull {
        /// Remote database URL or path of another local database
        /// (defaults to the configured remote)
        remote: Option<String>,
    },

    /// Push local changes to a remote database
    Push {
        /// Remote database URL or path of another local database
        /// (defaults to the configured remote)
        remote: Option<String>,

        /// Create the remote database if it does not exist
        #[arg(long)]
        create: bool,
    },

    /// Pull, then push
    Sync {
        /// Remote database URL or path of another local database
        /// (defaults to the configured remote)
        remote: Option<String>,
    },

    /// List documents with conflicting revisions
    Conflicts,

    /// Resolve a conflicted document by keeping one of its leaves
    Resolve {
        /// Document id
        id: String,

        /// Revision to keep; every other live leaf is deleted
        #[arg(short, long)]
        keep: String,
    },

    /// Drop bodies of superseded revisions and unused attachment content
    Compact,

    /// Show database and replication status
    Status {
        /// Remote whose checkpoints to show (defaults to the configured remote)
        remote: Option<String>,
    },

    /// Show or change configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Print the config file location
    Path,

    /// Set the default remote database URL
    Remote {
        /// Remote database URL
        url: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_resolve_with_global_database() {
        let cli = Cli::parse_from([
            "couchsync", "resolve", "doc", "--keep", "2-abc", "--database", "/tmp/x.db",
        ]);
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Commands::Resolve { id, keep } => {
                assert_eq!(id, "doc");
                assert_eq!(keep, "2-abc");
            }
            _ => panic!("expected resolve"),
        }
    }
}
