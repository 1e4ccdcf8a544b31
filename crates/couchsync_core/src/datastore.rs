//! Document datastore built on a [`RevisionStore`].
//!
//! The datastore owns the revision-tree invariants:
//!
//! - Every mutation runs in one store transaction and re-picks the winning
//!   revision before committing, so exactly one leaf per document carries
//!   `current = true`.
//! - Revisions are append-only. Updates, deletions and conflict resolution
//!   all add child revisions.
//! - Events are emitted after commit.
//!
//! # Example
//!
//! ```ignore
//! use couchsync_core::{Datastore, revision::DocumentBody};
//! use serde_json::json;
//!
//! let ds = Datastore::in_memory();
//! let body = DocumentBody::from_value(json!({"title": "hello"}))?;
//! let rev = ds.create_document(Some("greeting"), body, vec![])?;
//! let doc = ds.get_document("greeting", None)?;
//! assert_eq!(doc.rev_id, rev.rev_id);
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};

use crate::conflict::ConflictResolver;
use crate::error::{Result, SyncError};
use crate::events::{DocumentEvent, EventCallback, EventRegistry, SubscriptionId};
use crate::revision::{
    Attachment, DocumentBody, DocumentRevision, IncomingAttachment, RevisionId, RevisionTree,
    UnsavedAttachment, attachment_key,
};
use crate::store::{CompactionStats, MemoryStorage, NewRevision, RevisionStore, StoreTransaction};

/// Default cap on the ancestors returned by [`Datastore::possible_ancestors`].
pub const POSSIBLE_ANCESTORS_LIMIT: usize = 50;

/// A remote revision history to merge into the local tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ForceInsertItem {
    /// Document id.
    pub doc_id: String,
    /// Revision ids ordered from the oldest ancestor to the new leaf.
    pub history: Vec<RevisionId>,
    /// Whether the new leaf is a tombstone.
    pub deleted: bool,
    /// Body of the new leaf.
    pub body: DocumentBody,
    /// Attachments of the new leaf.
    pub attachments: Vec<IncomingAttachment>,
}

impl ForceInsertItem {
    /// Build an item without attachments.
    pub fn new(
        doc_id: impl Into<String>,
        history: Vec<RevisionId>,
        body: DocumentBody,
        deleted: bool,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            history,
            deleted,
            body,
            attachments: Vec::new(),
        }
    }

    /// Attach incoming attachments.
    pub fn with_attachments(mut self, attachments: Vec<IncomingAttachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// The revision being inserted, i.e. the last history entry.
    pub fn rev_id(&self) -> Option<&RevisionId> {
        self.history.last()
    }

    /// Check the history is usable before touching the store.
    fn validate(&self) -> Result<()> {
        if self.doc_id.is_empty() {
            return Err(SyncError::InvalidArgument(
                "force insert requires a document id".into(),
            ));
        }
        if self.history.is_empty() {
            return Err(SyncError::InvalidArgument(format!(
                "empty revision history for '{}'",
                self.doc_id
            )));
        }
        for pair in self.history.windows(2) {
            if pair[1].generation() != pair[0].generation() + 1 {
                return Err(SyncError::InvalidArgument(format!(
                    "revision history of '{}' is out of order: {} then {}",
                    self.doc_id, pair[0], pair[1]
                )));
            }
        }
        Ok(())
    }
}

/// One changed document in the local changes feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Highest sequence of the document.
    pub sequence: i64,
    /// Winning revision.
    pub revision: DocumentRevision,
    /// Every leaf, winner included.
    pub leaves: BTreeSet<RevisionId>,
}

/// A page of the local changes feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Changes {
    /// Changed documents in sequence order.
    pub results: Vec<Change>,
    /// Sequence to pass as `since` for the next page.
    pub last_sequence: i64,
}

/// Embedded document datastore.
pub struct Datastore {
    name: String,
    store: Box<dyn RevisionStore>,
    events: EventRegistry<DocumentEvent>,
}

impl Datastore {
    /// Create a datastore over an existing store.
    pub fn new(name: impl Into<String>, store: impl RevisionStore + 'static) -> Self {
        Self {
            name: name.into(),
            store: Box::new(store),
            events: EventRegistry::new(),
        }
    }

    /// Create an ephemeral in-memory datastore.
    pub fn in_memory() -> Self {
        let name = format!("memory:{}", uuid::Uuid::new_v4().simple());
        Self::new(name, MemoryStorage::new())
    }

    /// Open or create a SQLite-backed datastore at `path`.
    #[cfg(feature = "sqlite")]
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let store = crate::store::SqliteStorage::open(path)?;
        Ok(Self::new(format!("file:{}", path.display()), store))
    }

    /// Identifier used when deriving replication ids.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to document events.
    pub fn subscribe(&self, callback: EventCallback<DocumentEvent>) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Run `f` in a store transaction and hand back its result.
    fn transact<T>(
        &self,
        mut f: impl FnMut(&mut dyn StoreTransaction) -> Result<T>,
    ) -> Result<T> {
        let mut out = None;
        self.store.with_transaction(&mut |txn| {
            out = Some(f(txn)?);
            Ok(())
        })?;
        out.ok_or_else(|| SyncError::Storage("transaction completed without a result".into()))
    }

    fn emit_all(&self, events: &[DocumentEvent]) {
        for event in events {
            self.events.emit(event);
        }
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    /// Create a document. A random id is generated when `doc_id` is `None`.
    ///
    /// Creating over a deleted document extends its tombstone. Creating over
    /// a live document is a [`SyncError::Conflict`].
    pub fn create_document(
        &self,
        doc_id: Option<&str>,
        body: DocumentBody,
        attachments: Vec<UnsavedAttachment>,
    ) -> Result<DocumentRevision> {
        let doc_id = match doc_id {
            Some(id) => {
                validate_doc_id(id)?;
                id.to_string()
            }
            None => uuid::Uuid::new_v4().simple().to_string(),
        };

        let (revision, existed) = self.transact(|txn| {
            let tree = txn.read_tree(&doc_id)?;
            let parent = match &tree {
                Some(tree) => {
                    let winner = tree.current_revision().cloned();
                    match winner {
                        Some(w) if !w.deleted => {
                            return Err(SyncError::conflict(&doc_id, "document already exists"));
                        }
                        other => other,
                    }
                }
                None => None,
            };
            write_revision(txn, &doc_id, parent.as_ref(), false, &body, &attachments)?;
            Ok((refresh_winner(txn, &doc_id)?, tree.is_some()))
        })?;

        log::debug!("[Datastore] created {} at {}", doc_id, revision.rev_id);
        let event = if existed {
            DocumentEvent::Updated {
                doc_id,
                rev_id: revision.rev_id.to_string(),
            }
        } else {
            DocumentEvent::Created {
                doc_id,
                rev_id: revision.rev_id.to_string(),
            }
        };
        self.emit_all(&[event]);
        Ok(revision)
    }

    /// Add a revision on top of the leaf `prev_rev`.
    ///
    /// Attachments of `prev_rev` are carried forward; `attachments` add to or
    /// replace them by name.
    pub fn update_document(
        &self,
        doc_id: &str,
        prev_rev: &RevisionId,
        body: DocumentBody,
        attachments: Vec<UnsavedAttachment>,
    ) -> Result<DocumentRevision> {
        let revision = self.transact(|txn| {
            let parent = live_leaf(txn, doc_id, prev_rev)?;
            write_revision(txn, doc_id, Some(&parent), false, &body, &attachments)?;
            refresh_winner(txn, doc_id)
        })?;

        log::debug!("[Datastore] updated {} to {}", doc_id, revision.rev_id);
        self.emit_all(&[DocumentEvent::Updated {
            doc_id: doc_id.to_string(),
            rev_id: revision.rev_id.to_string(),
        }]);
        Ok(revision)
    }

    /// Delete the leaf `prev_rev` by adding a tombstone child.
    ///
    /// Returns the tombstone revision.
    pub fn delete_document(&self, doc_id: &str, prev_rev: &RevisionId) -> Result<DocumentRevision> {
        let (tombstone, winner) = self.transact(|txn| {
            let parent = live_leaf(txn, doc_id, prev_rev)?;
            let seq = write_revision(txn, doc_id, Some(&parent), true, &DocumentBody::empty(), &[])?;
            let winner = refresh_winner(txn, doc_id)?;
            let tombstone = read_revision_at(txn, doc_id, seq)?;
            Ok((tombstone, winner))
        })?;

        log::debug!("[Datastore] deleted {} at {}", doc_id, tombstone.rev_id);
        let event = if winner.deleted {
            DocumentEvent::Deleted {
                doc_id: doc_id.to_string(),
                rev_id: winner.rev_id.to_string(),
            }
        } else {
            DocumentEvent::Updated {
                doc_id: doc_id.to_string(),
                rev_id: winner.rev_id.to_string(),
            }
        };
        self.emit_all(&[event]);
        Ok(tombstone)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read the winning revision, or a specific one when `rev_id` is given.
    ///
    /// A document whose winner is deleted is reported as not found unless a
    /// revision is requested explicitly.
    pub fn get_document(&self, doc_id: &str, rev_id: Option<&RevisionId>) -> Result<DocumentRevision> {
        let tree = self.get_all_revisions(doc_id)?;
        match rev_id {
            Some(rev_id) => tree.lookup(rev_id).cloned().ok_or_else(|| {
                SyncError::RevisionNotFound {
                    doc_id: doc_id.to_string(),
                    rev_id: rev_id.to_string(),
                }
            }),
            None => tree
                .current_revision()
                .filter(|r| !r.deleted)
                .cloned()
                .ok_or_else(|| SyncError::DocumentNotFound(doc_id.to_string())),
        }
    }

    /// Read the full revision tree of a document.
    pub fn get_all_revisions(&self, doc_id: &str) -> Result<RevisionTree> {
        self.transact(|txn| txn.read_tree(doc_id))?
            .ok_or_else(|| SyncError::DocumentNotFound(doc_id.to_string()))
    }

    /// Attachment metadata of the revision at `sequence`.
    pub fn attachments(&self, sequence: i64) -> Result<Vec<Attachment>> {
        self.transact(|txn| txn.attachments(sequence))
    }

    /// Stored bytes of an attachment.
    pub fn attachment_data(&self, doc_id: &str, attachment: &Attachment) -> Result<Vec<u8>> {
        self.transact(|txn| txn.attachment_data(&attachment.key))?
            .ok_or_else(|| SyncError::attachment(doc_id, &attachment.name, "content missing"))
    }

    /// All document ids, deleted ones included.
    pub fn document_ids(&self) -> Result<Vec<String>> {
        self.transact(|txn| txn.doc_ids())
    }

    /// Highest sequence assigned so far.
    pub fn last_sequence(&self) -> Result<i64> {
        self.transact(|txn| txn.last_sequence())
    }

    /// Documents changed after `since`, with their winning revisions and
    /// leaf sets.
    pub fn changes(&self, since: i64, limit: usize) -> Result<Changes> {
        self.transact(|txn| {
            let rows = txn.changes_since(since, limit)?;
            let mut results = Vec::with_capacity(rows.len());
            for row in &rows {
                let Some(tree) = txn.read_tree(&row.doc_id)? else {
                    continue;
                };
                if let Some(winner) = tree.current_revision() {
                    results.push(Change {
                        sequence: row.sequence,
                        revision: winner.clone(),
                        leaves: tree.leaf_revision_ids(),
                    });
                }
            }
            let last_sequence = rows.last().map_or(since, |r| r.sequence);
            Ok(Changes {
                results,
                last_sequence,
            })
        })
    }

    /// Ids of documents with two or more non-deleted leaves.
    pub fn conflicted_document_ids(&self) -> Result<Vec<String>> {
        self.transact(|txn| txn.conflicted_doc_ids())
    }

    /// Which of the given revisions are not stored locally, stubs counting
    /// as stored. Documents with nothing missing are omitted.
    pub fn revs_diff(
        &self,
        revisions: &BTreeMap<String, BTreeSet<RevisionId>>,
    ) -> Result<BTreeMap<String, BTreeSet<RevisionId>>> {
        self.transact(|txn| {
            let mut missing = BTreeMap::new();
            for (doc_id, revs) in revisions {
                let tree = txn.read_tree(doc_id)?;
                let absent: BTreeSet<RevisionId> = revs
                    .iter()
                    .filter(|rev| tree.as_ref().is_none_or(|t| t.lookup(rev).is_none()))
                    .cloned()
                    .collect();
                if !absent.is_empty() {
                    missing.insert(doc_id.clone(), absent);
                }
            }
            Ok(missing)
        })
    }

    /// Locally available, non-deleted revisions of `doc_id` with a lower
    /// generation than `rev_id`, newest first.
    pub fn possible_ancestors(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
        limit: usize,
    ) -> Result<Vec<RevisionId>> {
        let Some(tree) = self.transact(|txn| txn.read_tree(doc_id))? else {
            return Ok(Vec::new());
        };
        let mut ancestors: Vec<RevisionId> = tree
            .iter()
            .filter(|r| r.available && !r.deleted && r.generation() < rev_id.generation())
            .map(|r| r.rev_id.clone())
            .collect();
        ancestors.sort_by(|a, b| b.cmp(a));
        ancestors.truncate(limit);
        Ok(ancestors)
    }

    /// Whether a locally known revision in `history` already holds the
    /// attachment `name` last changed at `revpos`.
    pub fn has_attachment_in_history(
        &self,
        doc_id: &str,
        history: &[RevisionId],
        name: &str,
        revpos: u64,
    ) -> Result<bool> {
        self.transact(|txn| {
            let Some(tree) = txn.read_tree(doc_id)? else {
                return Ok(false);
            };
            for rev in history.iter().rev() {
                if let Some(node) = tree.lookup(rev).filter(|n| n.available) {
                    let found = txn
                        .attachments(node.sequence)?
                        .into_iter()
                        .any(|a| a.name == name && a.revpos == revpos);
                    if found {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        })
    }

    // ========================================================================
    // Replication writes
    // ========================================================================

    /// Merge remote revision histories into the local trees.
    ///
    /// All items are applied in one transaction. Revisions already present
    /// are skipped. Returns the number of new leaves inserted.
    pub fn force_insert(&self, items: &[ForceInsertItem]) -> Result<usize> {
        for item in items {
            item.validate()?;
        }

        let events = self.transact(|txn| {
            let mut events = Vec::new();
            for item in items {
                if let Some(event) = force_insert_one(txn, item)? {
                    events.push(event);
                }
            }
            Ok(events)
        })?;

        log::debug!(
            "[Datastore] force inserted {} of {} revisions",
            events.len(),
            items.len()
        );
        self.emit_all(&events);
        Ok(events.len())
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    /// Resolve the conflicts of `doc_id` using `resolver`.
    ///
    /// Returns the new winning revision, or `None` when the document is not
    /// conflicted or the resolver declined. If the tree changed between the
    /// snapshot handed to the resolver and the write, nothing is written and
    /// a [`SyncError::Conflict`] asks the caller to retry.
    pub fn resolve_conflicts(
        &self,
        doc_id: &str,
        resolver: &dyn ConflictResolver,
    ) -> Result<Option<DocumentRevision>> {
        let snapshot = self.get_all_revisions(doc_id)?;
        if !snapshot.has_conflicts() {
            return Ok(None);
        }

        let conflicts: Vec<DocumentRevision> =
            snapshot.conflicting_leaves().into_iter().cloned().collect();
        let chosen = match resolver.resolve(doc_id, &conflicts) {
            Ok(Some(chosen)) => chosen,
            Ok(None) => {
                log::debug!("[Datastore] resolver declined {}", doc_id);
                return Ok(None);
            }
            Err(e) => {
                log::warn!("[Datastore] resolver failed for {}: {}", doc_id, e);
                return Ok(None);
            }
        };
        if chosen.doc_id != doc_id || !conflicts.iter().any(|c| c.rev_id == chosen.rev_id) {
            return Err(SyncError::InvalidArgument(format!(
                "resolver returned {} which is not a conflicting leaf of '{}'",
                chosen.rev_id, doc_id
            )));
        }
        let expected_leaves = snapshot.leaf_revision_ids();

        let winner = self.transact(|txn| {
            let tree = txn
                .read_tree(doc_id)?
                .ok_or_else(|| SyncError::DocumentNotFound(doc_id.to_string()))?;
            if tree.leaf_revision_ids() != expected_leaves {
                return Err(SyncError::conflict(
                    doc_id,
                    "revision tree changed during conflict resolution",
                ));
            }

            let mut kept = None;
            for leaf in tree.leaves() {
                if leaf.rev_id == chosen.rev_id {
                    kept = Some(leaf.clone());
                } else if !leaf.deleted {
                    write_revision(txn, doc_id, Some(leaf), true, &DocumentBody::empty(), &[])?;
                }
            }
            let kept = kept.ok_or_else(|| SyncError::RevisionNotFound {
                doc_id: doc_id.to_string(),
                rev_id: chosen.rev_id.to_string(),
            })?;

            if chosen.deleted {
                write_revision(txn, doc_id, Some(&kept), true, &DocumentBody::empty(), &[])?;
            } else if chosen.body != kept.body {
                write_revision(txn, doc_id, Some(&kept), false, &chosen.body, &[])?;
            }
            refresh_winner(txn, doc_id)
        })?;

        log::info!(
            "[Datastore] resolved {} conflicts on {}, winner {}",
            conflicts.len(),
            doc_id,
            winner.rev_id
        );
        let event = if winner.deleted {
            DocumentEvent::Deleted {
                doc_id: doc_id.to_string(),
                rev_id: winner.rev_id.to_string(),
            }
        } else {
            DocumentEvent::Updated {
                doc_id: doc_id.to_string(),
                rev_id: winner.rev_id.to_string(),
            }
        };
        self.emit_all(&[event]);
        Ok(Some(winner))
    }

    // ========================================================================
    // Maintenance and local documents
    // ========================================================================

    /// Drop bodies of non-leaf revisions and purge unreferenced attachments.
    pub fn compact(&self) -> Result<CompactionStats> {
        let stats = self.transact(|txn| txn.compact())?;
        log::info!(
            "[Datastore] compacted {} revisions, purged {} attachment blobs",
            stats.revisions,
            stats.blobs
        );
        Ok(stats)
    }

    /// Read a local (non-replicated) document.
    pub fn get_local_document(&self, id: &str) -> Result<Option<Value>> {
        self.transact(|txn| txn.get_local(id))
    }

    /// Write a local (non-replicated) document.
    pub fn put_local_document(&self, id: &str, body: &Value) -> Result<()> {
        self.transact(|txn| txn.put_local(id, body))
    }

    /// Delete a local document. Returns whether it existed.
    pub fn delete_local_document(&self, id: &str) -> Result<bool> {
        self.transact(|txn| txn.delete_local(id))
    }

    /// Last replicated sequence stored for `replication_id`.
    pub fn get_checkpoint(&self, replication_id: &str) -> Result<Option<String>> {
        let doc = self.get_local_document(&checkpoint_doc_id(replication_id))?;
        Ok(doc.and_then(|d| match d.get("lastSequence") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        }))
    }

    /// Store the last replicated sequence for `replication_id`.
    pub fn put_checkpoint(&self, replication_id: &str, sequence: &str) -> Result<()> {
        self.put_local_document(
            &checkpoint_doc_id(replication_id),
            &json!({ "lastSequence": sequence }),
        )
    }
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("name", &self.name)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// Local document id holding a replication checkpoint.
pub fn checkpoint_doc_id(replication_id: &str) -> String {
    format!("_local/{replication_id}")
}

fn validate_doc_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() {
        return Err(SyncError::InvalidArgument("document id must not be empty".into()));
    }
    if doc_id.starts_with('_') && !doc_id.starts_with("_design/") {
        return Err(SyncError::InvalidArgument(format!(
            "document id '{doc_id}' uses a reserved prefix"
        )));
    }
    Ok(())
}

/// The non-deleted leaf `prev_rev` of `doc_id`, or a conflict.
fn live_leaf(
    txn: &mut dyn StoreTransaction,
    doc_id: &str,
    prev_rev: &RevisionId,
) -> Result<DocumentRevision> {
    let tree = txn
        .read_tree(doc_id)?
        .ok_or_else(|| SyncError::DocumentNotFound(doc_id.to_string()))?;
    let node = tree
        .lookup(prev_rev)
        .ok_or_else(|| SyncError::conflict(doc_id, format!("unknown revision {prev_rev}")))?;
    if !tree.is_leaf(node.sequence) {
        return Err(SyncError::conflict(
            doc_id,
            format!("revision {prev_rev} is not a leaf"),
        ));
    }
    if node.deleted {
        return Err(SyncError::conflict(
            doc_id,
            format!("revision {prev_rev} is deleted"),
        ));
    }
    Ok(node.clone())
}

fn read_revision_at(
    txn: &mut dyn StoreTransaction,
    doc_id: &str,
    sequence: i64,
) -> Result<DocumentRevision> {
    txn.read_tree(doc_id)?
        .and_then(|tree| tree.by_sequence(sequence).cloned())
        .ok_or_else(|| SyncError::Storage(format!("sequence {sequence} vanished from '{doc_id}'")))
}

/// Insert a locally authored revision as a child of `parent`.
///
/// Live revisions inherit the parent's attachments before `attachments` are
/// applied on top.
fn write_revision(
    txn: &mut dyn StoreTransaction,
    doc_id: &str,
    parent: Option<&DocumentRevision>,
    deleted: bool,
    body: &DocumentBody,
    attachments: &[UnsavedAttachment],
) -> Result<i64> {
    let rev_id = RevisionId::generate(parent.map(|p| &p.rev_id), deleted, &body.to_bytes());
    let sequence = txn.insert_revision(NewRevision {
        doc_id: doc_id.to_string(),
        rev_id: rev_id.clone(),
        parent: parent.map(|p| p.sequence),
        deleted,
        current: false,
        available: true,
        body: if deleted {
            DocumentBody::empty()
        } else {
            body.clone()
        },
    })?;

    if deleted {
        return Ok(sequence);
    }
    if let Some(parent) = parent {
        for attachment in txn.attachments(parent.sequence)? {
            txn.add_attachment(sequence, &attachment)?;
        }
    }
    for unsaved in attachments {
        let key = attachment_key(&unsaved.data);
        txn.put_attachment_data(&key, &unsaved.data)?;
        txn.add_attachment(
            sequence,
            &Attachment {
                name: unsaved.name.clone(),
                key,
                content_type: unsaved.content_type.clone(),
                length: unsaved.data.len() as u64,
                encoded_length: unsaved.data.len() as u64,
                revpos: rev_id.generation(),
                encoding: Default::default(),
            },
        )?;
    }
    Ok(sequence)
}

/// Recompute the winner of `doc_id` and write the `current` flags back.
fn refresh_winner(txn: &mut dyn StoreTransaction, doc_id: &str) -> Result<DocumentRevision> {
    let tree = txn
        .read_tree(doc_id)?
        .ok_or_else(|| SyncError::DocumentNotFound(doc_id.to_string()))?;
    let winner = tree
        .current_revision()
        .cloned()
        .ok_or_else(|| SyncError::DocumentNotFound(doc_id.to_string()))?;
    for node in tree.iter() {
        let current = node.sequence == winner.sequence;
        if node.current != current {
            txn.set_current(node.sequence, current)?;
        }
    }
    Ok(DocumentRevision {
        current: true,
        ..winner
    })
}

/// Merge one history. Returns `None` when the leaf was already known.
fn force_insert_one(
    txn: &mut dyn StoreTransaction,
    item: &ForceInsertItem,
) -> Result<Option<DocumentEvent>> {
    let doc_id = item.doc_id.as_str();
    let tree = txn.read_tree(doc_id)?;
    let (ancestors, leaf_rev) = match item.history.split_last() {
        Some((leaf, ancestors)) => (ancestors, leaf),
        None => return Ok(None),
    };

    if tree.as_ref().is_some_and(|t| t.lookup(leaf_rev).is_some()) {
        log::trace!("[Datastore] {} {} already present", doc_id, leaf_rev);
        return Ok(None);
    }

    // Resolve or stub each ancestor, root-ward first.
    let mut parent: Option<i64> = None;
    let mut last_known: Option<i64> = None;
    for (i, rev) in ancestors.iter().enumerate() {
        match tree.as_ref().and_then(|t| t.lookup(rev)) {
            Some(node) => {
                if i > 0 && node.parent != parent {
                    return Err(SyncError::InvalidArgument(format!(
                        "history of '{doc_id}' places {rev} under a different parent than the local tree"
                    )));
                }
                parent = Some(node.sequence);
                last_known = Some(node.sequence);
            }
            None => {
                let seq = txn.insert_revision(NewRevision::stub(doc_id, rev.clone(), parent))?;
                parent = Some(seq);
            }
        }
    }

    let sequence = txn.insert_revision(NewRevision {
        doc_id: doc_id.to_string(),
        rev_id: leaf_rev.clone(),
        parent,
        deleted: item.deleted,
        current: false,
        available: true,
        body: item.body.clone(),
    })?;

    for attachment in &item.attachments {
        match attachment {
            IncomingAttachment::Data {
                name,
                content_type,
                revpos,
                encoding,
                length,
                data,
            } => {
                let key = attachment_key(data);
                txn.put_attachment_data(&key, data)?;
                txn.add_attachment(
                    sequence,
                    &Attachment {
                        name: name.clone(),
                        key,
                        content_type: content_type.clone(),
                        length: *length,
                        encoded_length: data.len() as u64,
                        revpos: *revpos,
                        encoding: *encoding,
                    },
                )?;
            }
            IncomingAttachment::Stub { name, revpos } => {
                let source = match (tree.as_ref(), last_known) {
                    (Some(tree), Some(seq)) => {
                        find_ancestor_attachment(txn, tree, seq, name)?
                    }
                    _ => None,
                };
                let Some(found) = source else {
                    return Err(SyncError::attachment(
                        doc_id,
                        name,
                        format!("stub at revpos {revpos} has no local ancestor holding it"),
                    ));
                };
                txn.add_attachment(sequence, &found)?;
            }
        }
    }

    let winner = refresh_winner(txn, doc_id)?;
    let rev_id = winner.rev_id.to_string();
    Ok(Some(match tree {
        None => DocumentEvent::Created {
            doc_id: doc_id.to_string(),
            rev_id,
        },
        Some(_) if winner.deleted => DocumentEvent::Deleted {
            doc_id: doc_id.to_string(),
            rev_id,
        },
        Some(_) => DocumentEvent::Updated {
            doc_id: doc_id.to_string(),
            rev_id,
        },
    }))
}

/// Nearest attachment named `name` on the path from `sequence` to the root.
fn find_ancestor_attachment(
    txn: &mut dyn StoreTransaction,
    tree: &RevisionTree,
    sequence: i64,
    name: &str,
) -> Result<Option<Attachment>> {
    for node in tree.path_for_node(sequence) {
        if !node.available {
            continue;
        }
        if let Some(found) = txn.attachments(node.sequence)?.into_iter().find(|a| a.name == name) {
            return Ok(Some(found));
        }
    }
    Ok(None)
}
