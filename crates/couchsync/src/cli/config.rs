//! Config command handlers

use couchsync_core::config::ReplicationConfig;

use crate::cli::args::ConfigCommands;
use crate::cli::replicate::open_remote;

pub fn handle_config_command(command: Option<ConfigCommands>, config: ReplicationConfig) -> bool {
    match command {
        None | Some(ConfigCommands::Show) => {
            show_config(&config);
            true
        }
        Some(ConfigCommands::Path) => match ReplicationConfig::config_path() {
            Some(path) => {
                println!("{}", path.display());
                true
            }
            None => {
                eprintln!("✗ Could not determine config directory");
                false
            }
        },
        Some(ConfigCommands::Remote { url }) => set_remote(config, url),
    }
}

/// Show the effective configuration
fn show_config(config: &ReplicationConfig) {
    println!("couchsync Configuration");
    println!("=======================");
    println!("Database: {}", config.database.display());
    println!(
        "Remote: {}",
        config.remote.as_deref().unwrap_or("(not set)")
    );
    println!(
        "Pull: {} changes/batch, {} batches/run, {} docs/insert, {} workers, inline attachments: {}",
        config.pull.change_limit_per_batch,
        config.pull.batch_limit_per_run,
        config.pull.insert_batch_size,
        config.pull.worker_threads,
        config.pull.pull_attachments_inline
    );
    if let Some(filter) = &config.pull.filter {
        println!("Pull filter: {} {:?}", filter.name, filter.params);
    }
    println!(
        "Push: {} changes/batch, {} batches/run, {} docs/request, attachments inline: {:?} (< {} bytes)",
        config.push.change_limit_per_batch,
        config.push.batch_limit_per_run,
        config.push.bulk_insert_size,
        config.push.attachment_inline,
        config.push.small_attachment_threshold
    );
    if let Some(path) = ReplicationConfig::config_path() {
        println!("Config file: {}", path.display());
    }
}

fn set_remote(mut config: ReplicationConfig, url: String) -> bool {
    let Some(remote) = open_remote(&config, Some(&url)) else {
        return false;
    };
    match remote.exists() {
        Ok(true) => {}
        Ok(false) => println!("Note: {} does not exist yet (push --create makes it)", url),
        Err(e) => println!("Note: could not reach {}: {}", url, e),
    }

    config.remote = Some(url);
    match config.save() {
        Ok(()) => {
            println!("✓ Default remote set to {}", remote.identifier());
            true
        }
        Err(e) => {
            eprintln!("✗ Could not save config: {}", e);
            false
        }
    }
}
