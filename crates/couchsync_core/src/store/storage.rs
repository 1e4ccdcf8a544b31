//! Storage abstraction for revision persistence.
//!
//! This module defines the [`RevisionStore`] trait which abstracts over
//! different storage backends (SQLite, in-memory). Every read and write goes
//! through a [`StoreTransaction`], so multi-step merges either commit as a
//! whole or leave no trace.

use serde_json::Value;

use crate::error::SyncError;
use crate::revision::{Attachment, DocumentBody, DocumentRevision, RevisionId, RevisionTree};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, SyncError>;

/// A revision about to be inserted. The store assigns its sequence.
#[derive(Debug, Clone)]
pub struct NewRevision {
    /// Document id.
    pub doc_id: String,
    /// Revision id.
    pub rev_id: RevisionId,
    /// Sequence of the parent revision, if any.
    pub parent: Option<i64>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Whether this is a leaf.
    pub current: bool,
    /// Whether the body is held locally.
    pub available: bool,
    /// Revision body.
    pub body: DocumentBody,
}

impl NewRevision {
    /// A placeholder for an ancestor whose body is not known locally.
    pub fn stub(doc_id: &str, rev_id: RevisionId, parent: Option<i64>) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            rev_id,
            parent,
            deleted: false,
            current: false,
            available: false,
            body: DocumentBody::empty(),
        }
    }

    pub(crate) fn into_revision(self, sequence: i64) -> DocumentRevision {
        DocumentRevision {
            doc_id: self.doc_id,
            rev_id: self.rev_id,
            sequence,
            parent: self.parent,
            deleted: self.deleted,
            current: self.current,
            available: self.available,
            body: self.body,
        }
    }
}

/// Latest change of one document, as seen by the changes feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    /// Document id.
    pub doc_id: String,
    /// Highest sequence of any revision of the document.
    pub sequence: i64,
}

/// Counts reported by [`StoreTransaction::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Non-leaf revisions whose bodies were dropped.
    pub revisions: usize,
    /// Attachment blobs no longer referenced and removed.
    pub blobs: usize,
}

/// Operations available inside a store transaction.
///
/// All calls made through one transaction observe each other's writes.
/// Nothing is visible to other transactions until the enclosing
/// [`RevisionStore::with_transaction`] closure returns `Ok`.
pub trait StoreTransaction {
    /// Insert a revision and return its newly assigned sequence.
    ///
    /// Sequences are globally monotonic and never reused.
    fn insert_revision(&mut self, revision: NewRevision) -> StorageResult<i64>;

    /// Set or clear the `current` flag of a revision.
    fn set_current(&mut self, sequence: i64, current: bool) -> StorageResult<()>;

    /// Load the full revision tree of a document, stubs included.
    ///
    /// Returns `None` if the document has no revisions.
    fn read_tree(&mut self, doc_id: &str) -> StorageResult<Option<RevisionTree>>;

    /// Highest sequence assigned so far, 0 for an empty store.
    fn last_sequence(&mut self) -> StorageResult<i64>;

    /// Documents changed after `since`, ordered by their latest sequence.
    fn changes_since(&mut self, since: i64, limit: usize) -> StorageResult<Vec<ChangeRow>>;

    /// All document ids, sorted.
    fn doc_ids(&mut self) -> StorageResult<Vec<String>>;

    /// Ids of documents with two or more non-deleted leaves, sorted.
    fn conflicted_doc_ids(&mut self) -> StorageResult<Vec<String>>;

    /// Attachment metadata of the revision at `sequence`, sorted by name.
    fn attachments(&mut self, sequence: i64) -> StorageResult<Vec<Attachment>>;

    /// Stored bytes for an attachment key.
    fn attachment_data(&mut self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Store attachment bytes under their content key. Existing keys are kept.
    fn put_attachment_data(&mut self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Attach metadata to the revision at `sequence`, replacing any entry
    /// with the same name. The content key must already be stored.
    fn add_attachment(&mut self, sequence: i64, attachment: &Attachment) -> StorageResult<()>;

    /// Read a local (non-replicated) document.
    fn get_local(&mut self, id: &str) -> StorageResult<Option<Value>>;

    /// Write a local document, replacing any previous value.
    fn put_local(&mut self, id: &str, body: &Value) -> StorageResult<()>;

    /// Delete a local document. Returns whether it existed.
    fn delete_local(&mut self, id: &str) -> StorageResult<bool>;

    /// Drop bodies and attachments of non-leaf revisions and purge
    /// attachment blobs no revision references.
    fn compact(&mut self) -> StorageResult<CompactionStats>;
}

/// Trait for revision storage backends.
///
/// Implementations serialize transactions: at most one runs at a time, so
/// concurrent replications and local writes interleave only at transaction
/// boundaries.
pub trait RevisionStore: Send + Sync {
    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    fn with_transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTransaction) -> StorageResult<()>,
    ) -> StorageResult<()>;
}
