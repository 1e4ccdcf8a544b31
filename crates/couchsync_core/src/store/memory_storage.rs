//! In-memory storage implementation.
//!
//! This provides a simple in-memory implementation of [`RevisionStore`]
//! for unit tests and ephemeral datastores.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use serde_json::Value;

use super::storage::{
    ChangeRow, CompactionStats, NewRevision, RevisionStore, StorageResult, StoreTransaction,
};
use crate::error::SyncError;
use crate::revision::{Attachment, DocumentBody, DocumentRevision, RevisionId, RevisionTree};

/// In-memory revision storage.
///
/// Transactions write straight into the shared maps and record an undo log;
/// a failed transaction replays the log backwards. Data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Revisions keyed by sequence
    revs: BTreeMap<i64, DocumentRevision>,

    /// doc_id -> rev_id -> sequence
    index: HashMap<String, HashMap<RevisionId, i64>>,

    /// Sequences with at least one child
    parents: BTreeSet<i64>,

    /// Attachment metadata (sequence -> name -> attachment)
    attachments: HashMap<i64, BTreeMap<String, Attachment>>,

    /// Content-addressed attachment bytes
    blobs: HashMap<String, Vec<u8>>,

    /// Local documents
    local: HashMap<String, Value>,

    /// Last assigned sequence
    last_sequence: i64,
}

/// Inverse of one write made inside a transaction.
#[derive(Debug)]
enum Undo {
    Revision {
        sequence: i64,
        marked_parent: Option<i64>,
    },
    Current {
        sequence: i64,
        previous: bool,
    },
    Blob(String),
    Attachment {
        sequence: i64,
        name: String,
        previous: Option<Attachment>,
    },
    Local {
        id: String,
        previous: Option<Value>,
    },
    /// Whole-state copy, taken only by compaction.
    Snapshot(Box<MemoryState>),
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RevisionStore for MemoryStorage {
    fn with_transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTransaction) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SyncError::Storage("memory storage mutex poisoned".into()))?;
        let mut txn = MemoryTransaction {
            state: &mut *state,
            undo: Vec::new(),
        };
        match f(&mut txn) {
            Ok(()) => Ok(()),
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }
}

impl MemoryState {
    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Revision {
                sequence,
                marked_parent,
            } => {
                if let Some(rev) = self.revs.remove(&sequence) {
                    let emptied = self.index.get_mut(&rev.doc_id).is_some_and(|revs| {
                        revs.remove(&rev.rev_id);
                        revs.is_empty()
                    });
                    if emptied {
                        self.index.remove(&rev.doc_id);
                    }
                }
                if let Some(parent) = marked_parent {
                    self.parents.remove(&parent);
                }
                self.last_sequence = sequence - 1;
            }
            Undo::Current { sequence, previous } => {
                if let Some(rev) = self.revs.get_mut(&sequence) {
                    rev.current = previous;
                }
            }
            Undo::Blob(key) => {
                self.blobs.remove(&key);
            }
            Undo::Attachment {
                sequence,
                name,
                previous,
            } => {
                let atts = self.attachments.entry(sequence).or_default();
                match previous {
                    Some(attachment) => {
                        atts.insert(name, attachment);
                    }
                    None => {
                        atts.remove(&name);
                    }
                }
                if atts.is_empty() {
                    self.attachments.remove(&sequence);
                }
            }
            Undo::Local { id, previous } => match previous {
                Some(body) => {
                    self.local.insert(id, body);
                }
                None => {
                    self.local.remove(&id);
                }
            },
            Undo::Snapshot(state) => *self = *state,
        }
    }

    fn compact(&mut self) -> CompactionStats {
        let mut stats = CompactionStats::default();
        for rev in self.revs.values_mut() {
            if rev.available && self.parents.contains(&rev.sequence) {
                rev.available = false;
                rev.body = DocumentBody::empty();
                stats.revisions += 1;
            }
        }

        let revs = &self.revs;
        self.attachments
            .retain(|seq, _| revs.get(seq).is_none_or(|r| r.available));

        let referenced: BTreeSet<&str> = self
            .attachments
            .values()
            .flat_map(|atts| atts.values().map(|a| a.key.as_str()))
            .collect();
        let before = self.blobs.len();
        self.blobs.retain(|key, _| referenced.contains(key.as_str()));
        stats.blobs = before - self.blobs.len();
        stats
    }
}

/// A live transaction over the shared state.
struct MemoryTransaction<'s> {
    state: &'s mut MemoryState,
    undo: Vec<Undo>,
}

impl MemoryTransaction<'_> {
    fn rollback(mut self) {
        while let Some(undo) = self.undo.pop() {
            self.state.revert(undo);
        }
    }
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn insert_revision(&mut self, revision: NewRevision) -> StorageResult<i64> {
        let known = self
            .state
            .index
            .get(&revision.doc_id)
            .is_some_and(|revs| revs.contains_key(&revision.rev_id));
        if known {
            return Err(SyncError::Storage(format!(
                "revision {} of '{}' already stored",
                revision.rev_id, revision.doc_id
            )));
        }

        let state = &mut *self.state;
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        state
            .index
            .entry(revision.doc_id.clone())
            .or_default()
            .insert(revision.rev_id.clone(), sequence);
        let marked_parent = revision.parent.filter(|p| state.parents.insert(*p));
        state.revs.insert(sequence, revision.into_revision(sequence));
        self.undo.push(Undo::Revision {
            sequence,
            marked_parent,
        });
        Ok(sequence)
    }

    fn set_current(&mut self, sequence: i64, current: bool) -> StorageResult<()> {
        if let Some(rev) = self.state.revs.get_mut(&sequence) {
            let previous = std::mem::replace(&mut rev.current, current);
            self.undo.push(Undo::Current { sequence, previous });
        }
        Ok(())
    }

    fn read_tree(&mut self, doc_id: &str) -> StorageResult<Option<RevisionTree>> {
        let Some(revs) = self.state.index.get(doc_id) else {
            return Ok(None);
        };
        let revisions: Vec<DocumentRevision> = revs
            .values()
            .filter_map(|seq| self.state.revs.get(seq).cloned())
            .collect();
        RevisionTree::from_revisions(doc_id, revisions).map(Some)
    }

    fn last_sequence(&mut self) -> StorageResult<i64> {
        Ok(self.state.last_sequence)
    }

    fn changes_since(&mut self, since: i64, limit: usize) -> StorageResult<Vec<ChangeRow>> {
        // Ascending scan: the last sequence seen per document is its highest.
        let mut latest: HashMap<&str, i64> = HashMap::new();
        for (sequence, rev) in self.state.revs.range(since.saturating_add(1)..) {
            latest.insert(rev.doc_id.as_str(), *sequence);
        }
        let mut rows: Vec<ChangeRow> = latest
            .into_iter()
            .map(|(doc_id, sequence)| ChangeRow {
                doc_id: doc_id.to_string(),
                sequence,
            })
            .collect();
        rows.sort_by_key(|r| r.sequence);
        rows.truncate(limit);
        Ok(rows)
    }

    fn doc_ids(&mut self) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self.state.index.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn conflicted_doc_ids(&mut self) -> StorageResult<Vec<String>> {
        let mut live_leaves: BTreeMap<&str, usize> = BTreeMap::new();
        for rev in self.state.revs.values() {
            if !rev.deleted && !self.state.parents.contains(&rev.sequence) {
                *live_leaves.entry(rev.doc_id.as_str()).or_default() += 1;
            }
        }
        Ok(live_leaves
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(id, _)| id.to_string())
            .collect())
    }

    fn attachments(&mut self, sequence: i64) -> StorageResult<Vec<Attachment>> {
        Ok(self
            .state
            .attachments
            .get(&sequence)
            .map(|atts| atts.values().cloned().collect())
            .unwrap_or_default())
    }

    fn attachment_data(&mut self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.state.blobs.get(key).cloned())
    }

    fn put_attachment_data(&mut self, key: &str, data: &[u8]) -> StorageResult<()> {
        if !self.state.blobs.contains_key(key) {
            self.state.blobs.insert(key.to_string(), data.to_vec());
            self.undo.push(Undo::Blob(key.to_string()));
        }
        Ok(())
    }

    fn add_attachment(&mut self, sequence: i64, attachment: &Attachment) -> StorageResult<()> {
        if !self.state.blobs.contains_key(&attachment.key) {
            return Err(SyncError::Storage(format!(
                "no stored content for attachment key {}",
                attachment.key
            )));
        }
        let previous = self
            .state
            .attachments
            .entry(sequence)
            .or_default()
            .insert(attachment.name.clone(), attachment.clone());
        self.undo.push(Undo::Attachment {
            sequence,
            name: attachment.name.clone(),
            previous,
        });
        Ok(())
    }

    fn get_local(&mut self, id: &str) -> StorageResult<Option<Value>> {
        Ok(self.state.local.get(id).cloned())
    }

    fn put_local(&mut self, id: &str, body: &Value) -> StorageResult<()> {
        let previous = self.state.local.insert(id.to_string(), body.clone());
        self.undo.push(Undo::Local {
            id: id.to_string(),
            previous,
        });
        Ok(())
    }

    fn delete_local(&mut self, id: &str) -> StorageResult<bool> {
        let previous = self.state.local.remove(id);
        let existed = previous.is_some();
        if existed {
            self.undo.push(Undo::Local {
                id: id.to_string(),
                previous,
            });
        }
        Ok(existed)
    }

    fn compact(&mut self) -> StorageResult<CompactionStats> {
        self.undo.push(Undo::Snapshot(Box::new(self.state.clone())));
        Ok(self.state.compact())
    }
}
