//! Replication command handlers.
//!
//! A remote is either a CouchDB URL or the path of another local database.

use std::sync::Arc;

use couchsync_core::Datastore;
use couchsync_core::config::ReplicationConfig;
use couchsync_core::events::ReplicationEvent;
use couchsync_core::replication::{
    CouchClient, DatastoreRemote, PullStrategy, PushStrategy, RemoteDatabase, ReplicationStrategy,
    Replicator,
};

use super::{open_datastore, progress};

/// Open the remote named on the command line, or the configured one.
pub(super) fn open_remote(
    config: &ReplicationConfig,
    remote: Option<&str>,
) -> Option<Arc<dyn RemoteDatabase>> {
    let Some(location) = remote.map(str::to_string).or_else(|| config.remote.clone()) else {
        eprintln!("✗ No remote given and none configured.");
        eprintln!("  Set one with: couchsync config remote <URL>");
        return None;
    };

    if location.starts_with("http://") || location.starts_with("https://") {
        return match CouchClient::new(&location) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                eprintln!("✗ {}", e);
                None
            }
        };
    }

    match Datastore::open(&location) {
        Ok(ds) => Some(Arc::new(DatastoreRemote::new(Arc::new(ds)))),
        Err(e) => {
            eprintln!("✗ Could not open local database {}: {}", location, e);
            None
        }
    }
}

/// Run one strategy in the foreground, printing each batch.
fn run_replication(label: &str, strategy: Arc<dyn ReplicationStrategy>) -> bool {
    let replicator = Replicator::new(strategy);
    replicator.subscribe(Arc::new(|event: &ReplicationEvent| {
        if let ReplicationEvent::BatchCompleted {
            batch,
            documents,
            checkpoint,
            ..
        } = event
        {
            println!("  batch {}: {} documents (checkpoint {})", batch, documents, checkpoint);
        }
    }));

    progress::show_running();
    match replicator.run() {
        Ok(summary) => {
            progress::hide();
            println!(
                "✓ {} complete: {} revisions from {} changed documents in {} batches",
                label, summary.revisions, summary.documents, summary.batches
            );
            true
        }
        Err(e) => {
            progress::show_error();
            eprintln!("✗ {} failed: {}", label, e);
            if e.is_retryable() {
                eprintln!("  Re-run to resume from the last checkpoint.");
            }
            false
        }
    }
}

/// Handle `couchsync pull`.
pub fn handle_pull(config: &ReplicationConfig, remote: Option<&str>) -> bool {
    let (Some(local), Some(remote)) = (open_datastore(config), open_remote(config, remote)) else {
        return false;
    };
    println!("Pulling from {}", remote.identifier());
    let strategy = PullStrategy::new(remote, local, config.pull.clone());
    run_replication("Pull", Arc::new(strategy))
}

/// Handle `couchsync push`.
pub fn handle_push(config: &ReplicationConfig, remote: Option<&str>, create: bool) -> bool {
    let (Some(local), Some(remote)) = (open_datastore(config), open_remote(config, remote)) else {
        return false;
    };
    if create && let Err(e) = remote.create() {
        eprintln!("✗ Could not create {}: {}", remote.identifier(), e);
        return false;
    }
    println!("Pushing to {}", remote.identifier());
    let strategy = PushStrategy::new(local, remote, config.push.clone());
    run_replication("Push", Arc::new(strategy))
}

/// Handle `couchsync sync`: pull, then push.
pub fn handle_sync(config: &ReplicationConfig, remote: Option<&str>) -> bool {
    let (Some(local), Some(remote)) = (open_datastore(config), open_remote(config, remote)) else {
        return false;
    };
    println!("Syncing with {}", remote.identifier());
    let pull = PullStrategy::new(Arc::clone(&remote), Arc::clone(&local), config.pull.clone());
    if !run_replication("Pull", Arc::new(pull)) {
        return false;
    }
    let push = PushStrategy::new(local, remote, config.push.clone());
    run_replication("Push", Arc::new(push))
}
