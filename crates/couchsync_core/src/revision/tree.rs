//! Revision tree of a single document.
//!
//! Nodes are kept in a flat map keyed by sequence with parent pointers.
//! Path walks follow the parent pointers iteratively, so arbitrarily deep
//! histories never recurse.
//!
//! A document may have several roots: two replicas that independently create
//! the same document id end up sharing one forest.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::document::DocumentRevision;
use super::rev_id::RevisionId;
use crate::error::{Result, SyncError};

/// The full revision forest of one document.
#[derive(Debug, Clone)]
pub struct RevisionTree {
    doc_id: String,
    nodes: BTreeMap<i64, DocumentRevision>,
    by_rev: HashMap<RevisionId, i64>,
    /// Sequences referenced as a parent by at least one node.
    parents: BTreeSet<i64>,
}

impl RevisionTree {
    /// Create an empty tree for `doc_id`.
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: BTreeMap::new(),
            by_rev: HashMap::new(),
            parents: BTreeSet::new(),
        }
    }

    /// Build a tree from a set of revisions, in any order.
    pub fn from_revisions(
        doc_id: impl Into<String>,
        revisions: impl IntoIterator<Item = DocumentRevision>,
    ) -> Result<Self> {
        let mut tree = Self::new(doc_id);
        let mut revisions: Vec<_> = revisions.into_iter().collect();
        revisions.sort_by_key(|r| r.sequence);
        for revision in revisions {
            tree.add(revision)?;
        }
        Ok(tree)
    }

    /// Insert a node.
    ///
    /// A node whose parent sequence is not in the tree is treated as hanging
    /// off an implicit root. When the parent is present, the generation must
    /// be exactly one above the parent's.
    pub fn add(&mut self, revision: DocumentRevision) -> Result<()> {
        if revision.doc_id != self.doc_id {
            return Err(SyncError::InvalidArgument(format!(
                "revision of '{}' added to tree of '{}'",
                revision.doc_id, self.doc_id
            )));
        }
        if self.by_rev.contains_key(&revision.rev_id) || self.nodes.contains_key(&revision.sequence)
        {
            return Err(SyncError::InvalidArgument(format!(
                "duplicate revision {} (seq {}) in '{}'",
                revision.rev_id, revision.sequence, self.doc_id
            )));
        }
        if let Some(parent) = revision.parent.and_then(|p| self.nodes.get(&p)) {
            if parent.generation() + 1 != revision.generation() {
                return Err(SyncError::InvalidArgument(format!(
                    "revision {} is not a direct child of {}",
                    revision.rev_id, parent.rev_id
                )));
            }
        }

        if let Some(parent) = revision.parent {
            self.parents.insert(parent);
        }
        self.by_rev.insert(revision.rev_id.clone(), revision.sequence);
        self.nodes.insert(revision.sequence, revision);
        Ok(())
    }

    /// Document id.
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Number of nodes, stubs included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &DocumentRevision> {
        self.nodes.values()
    }

    /// Point lookup by revision id.
    pub fn lookup(&self, rev_id: &RevisionId) -> Option<&DocumentRevision> {
        self.by_rev.get(rev_id).and_then(|seq| self.nodes.get(seq))
    }

    /// Point lookup by sequence.
    pub fn by_sequence(&self, sequence: i64) -> Option<&DocumentRevision> {
        self.nodes.get(&sequence)
    }

    /// Whether `sequence` is a node with no children.
    pub fn is_leaf(&self, sequence: i64) -> bool {
        self.nodes.contains_key(&sequence) && !self.parents.contains(&sequence)
    }

    /// Nodes with no children, in sequence order.
    pub fn leaves(&self) -> Vec<&DocumentRevision> {
        self.nodes
            .values()
            .filter(|r| !self.parents.contains(&r.sequence))
            .collect()
    }

    /// Revision ids of all leaves: the document's open revisions.
    pub fn leaf_revision_ids(&self) -> BTreeSet<RevisionId> {
        self.leaves().into_iter().map(|r| r.rev_id.clone()).collect()
    }

    /// Nodes with no known parent.
    pub fn roots(&self) -> Vec<&DocumentRevision> {
        self.nodes
            .values()
            .filter(|r| r.parent.is_none_or(|p| !self.nodes.contains_key(&p)))
            .collect()
    }

    /// The document's winning revision.
    pub fn current_revision(&self) -> Option<&DocumentRevision> {
        pick_winner(self.leaves())
    }

    /// Path from the node at `sequence` up to its root, node first.
    pub fn path_for_node(&self, sequence: i64) -> Vec<&DocumentRevision> {
        let mut path = Vec::new();
        let mut next = self.nodes.get(&sequence);
        while let Some(node) = next {
            path.push(node);
            next = node.parent.and_then(|p| self.nodes.get(&p));
        }
        path
    }

    /// Revision ids along the path from `sequence` to its root, node first.
    pub fn path_revision_ids(&self, sequence: i64) -> Vec<RevisionId> {
        self.path_for_node(sequence)
            .into_iter()
            .map(|r| r.rev_id.clone())
            .collect()
    }

    /// True iff two or more leaves are not deleted.
    pub fn has_conflicts(&self) -> bool {
        self.leaves().iter().filter(|r| !r.deleted).count() > 1
    }

    /// Non-deleted leaves. More than one means the document is conflicted.
    pub fn conflicting_leaves(&self) -> Vec<&DocumentRevision> {
        self.leaves().into_iter().filter(|r| !r.deleted).collect()
    }
}

/// Pick the winning revision among `leaves`.
///
/// Non-deleted leaves beat deleted ones, then the higher generation wins,
/// then the byte-wise greater suffix. The result depends only on the set of
/// leaves, never on their order.
pub fn pick_winner<'a>(
    leaves: impl IntoIterator<Item = &'a DocumentRevision>,
) -> Option<&'a DocumentRevision> {
    leaves
        .into_iter()
        .max_by(|a, b| (!a.deleted, &a.rev_id).cmp(&(!b.deleted, &b.rev_id)))
}
