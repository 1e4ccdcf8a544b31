//! Embedded document datastore with CouchDB-compatible replication.
//!
//! Documents are stored as revision trees. Concurrent edits made on
//! different replicas are merged with [`Datastore::force_insert`], a
//! deterministic winner is picked for every document, and conflicts can be
//! settled with a [`conflict::ConflictResolver`]. The [`replication`] module
//! pulls from and pushes to CouchDB-compatible databases with resumable
//! checkpoints.
#![warn(missing_docs)]

/// Configuration options
pub mod config;

/// Pluggable conflict resolution
pub mod conflict;

/// Document datastore (revision trees, winner selection, history merge)
pub mod datastore;

/// Error (common error types)
pub mod error;

/// Datastore and replication events
pub mod events;

/// Pull/push replication with remote databases
pub mod replication;

/// Revision ids, documents and revision trees
pub mod revision;

/// Storage engines
pub mod store;

pub use datastore::{Datastore, ForceInsertItem};
pub use error::{Result, SyncError};
