//! Local database command handlers.

use std::sync::Arc;

use couchsync_core::config::ReplicationConfig;
use couchsync_core::replication::{PullStrategy, PushStrategy, ReplicationStrategy};
use couchsync_core::revision::{DocumentRevision, RevisionId};

use super::open_datastore;
use super::replicate::open_remote;

/// Handle `couchsync conflicts`.
pub fn handle_conflicts(config: &ReplicationConfig) -> bool {
    let Some(ds) = open_datastore(config) else {
        return false;
    };
    let ids = match ds.conflicted_document_ids() {
        Ok(ids) => ids,
        Err(e) => {
            eprintln!("✗ {}", e);
            return false;
        }
    };
    if ids.is_empty() {
        println!("✓ No conflicts");
        return true;
    }

    for id in &ids {
        let tree = match ds.get_all_revisions(id) {
            Ok(tree) => tree,
            Err(e) => {
                eprintln!("✗ {}: {}", id, e);
                return false;
            }
        };
        let winner = tree.current_revision().map(|r| r.rev_id.clone());
        println!("{}", id);
        for leaf in tree.conflicting_leaves() {
            let marker = if Some(&leaf.rev_id) == winner.as_ref() {
                " (winner)"
            } else {
                ""
            };
            println!("  {}{}", leaf.rev_id, marker);
        }
    }
    println!("{} conflicted documents", ids.len());
    true
}

/// Handle `couchsync resolve <id> --keep <rev>`.
pub fn handle_resolve(config: &ReplicationConfig, id: &str, keep: &str) -> bool {
    let keep = match RevisionId::parse(keep) {
        Ok(rev) => rev,
        Err(e) => {
            eprintln!("✗ {}", e);
            return false;
        }
    };
    let Some(ds) = open_datastore(config) else {
        return false;
    };

    match ds.get_all_revisions(id) {
        Ok(tree) if !tree.has_conflicts() => {
            println!("✓ {} has no conflicts", id);
            return true;
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!("✗ {}", e);
            return false;
        }
    }

    let chosen = keep.clone();
    let resolver = move |_: &str, leaves: &[DocumentRevision]| {
        leaves.iter().find(|leaf| leaf.rev_id == chosen).cloned()
    };
    match ds.resolve_conflicts(id, &resolver) {
        Ok(Some(winner)) => {
            println!("✓ Resolved {}: winner is now {}", id, winner.rev_id);
            true
        }
        Ok(None) => {
            eprintln!("✗ {} has no conflicting leaf {}", id, keep);
            false
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            if e.is_retryable() {
                eprintln!("  The document changed meanwhile; run the command again.");
            }
            false
        }
    }
}

/// Handle `couchsync compact`.
pub fn handle_compact(config: &ReplicationConfig) -> bool {
    let Some(ds) = open_datastore(config) else {
        return false;
    };
    match ds.compact() {
        Ok(stats) => {
            println!(
                "✓ Compacted {} revisions, removed {} attachment blobs",
                stats.revisions, stats.blobs
            );
            true
        }
        Err(e) => {
            eprintln!("✗ Compaction failed: {}", e);
            false
        }
    }
}

/// Handle `couchsync status`.
pub fn handle_status(config: &ReplicationConfig, remote: Option<&str>) -> bool {
    let Some(ds) = open_datastore(config) else {
        return false;
    };

    let summary = ds.document_ids().and_then(|ids| {
        Ok((
            ids.len(),
            ds.last_sequence()?,
            ds.conflicted_document_ids()?.len(),
        ))
    });
    let (documents, sequence, conflicts) = match summary {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("✗ {}", e);
            return false;
        }
    };

    println!("Database: {}", config.database.display());
    println!("  Documents: {}", documents);
    println!("  Last sequence: {}", sequence);
    println!("  Conflicted documents: {}", conflicts);

    if remote.is_none() && config.remote.is_none() {
        return true;
    }
    let Some(remote) = open_remote(config, remote) else {
        return false;
    };

    println!("Remote: {}", remote.identifier());
    let pull = PullStrategy::new(Arc::clone(&remote), Arc::clone(&ds), config.pull.clone());
    match ds.get_checkpoint(pull.replication_id()) {
        Ok(checkpoint) => println!(
            "  Pull checkpoint: {}",
            checkpoint.as_deref().unwrap_or("none")
        ),
        Err(e) => eprintln!("  ✗ Pull checkpoint unavailable: {}", e),
    }
    let push = PushStrategy::new(ds, Arc::clone(&remote), config.push.clone());
    match remote.get_checkpoint(push.replication_id()) {
        Ok(checkpoint) => println!(
            "  Push checkpoint: {}",
            checkpoint.as_deref().unwrap_or("none")
        ),
        Err(e) => eprintln!("  ✗ Push checkpoint unavailable: {}", e),
    }
    true
}
