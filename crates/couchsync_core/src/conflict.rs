//! Pluggable conflict resolution.
//!
//! A [`ConflictResolver`] is handed the non-deleted leaves of one conflicted
//! document and picks the revision that survives. See
//! [`Datastore::resolve_conflicts`](crate::Datastore::resolve_conflicts) for
//! how the choice is applied.

use crate::error::Result;
use crate::revision::{DocumentRevision, pick_winner};

/// Strategy deciding which of a document's conflicting leaves survives.
///
/// Returning `Ok(None)` or an error leaves the document untouched.
/// The returned revision may carry a modified body, in which case the body
/// is written as a new child of that leaf, or have `deleted` set, in which
/// case the document becomes deleted.
pub trait ConflictResolver {
    /// Pick the surviving revision among `conflicts`.
    fn resolve(
        &self,
        doc_id: &str,
        conflicts: &[DocumentRevision],
    ) -> Result<Option<DocumentRevision>>;
}

impl<F> ConflictResolver for F
where
    F: Fn(&str, &[DocumentRevision]) -> Option<DocumentRevision>,
{
    fn resolve(
        &self,
        doc_id: &str,
        conflicts: &[DocumentRevision],
    ) -> Result<Option<DocumentRevision>> {
        Ok(self(doc_id, conflicts))
    }
}

/// Keeps the automatically chosen winner and deletes every other leaf.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepWinner;

impl ConflictResolver for KeepWinner {
    fn resolve(
        &self,
        _doc_id: &str,
        conflicts: &[DocumentRevision],
    ) -> Result<Option<DocumentRevision>> {
        Ok(pick_winner(conflicts).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{DocumentBody, RevisionId};

    fn leaf(seq: i64, rev: &str) -> DocumentRevision {
        DocumentRevision {
            doc_id: "doc".into(),
            rev_id: RevisionId::parse(rev).unwrap(),
            sequence: seq,
            parent: None,
            deleted: false,
            current: false,
            available: true,
            body: DocumentBody::empty(),
        }
    }

    #[test]
    fn test_keep_winner_picks_highest() {
        let leaves = vec![leaf(1, "2-a"), leaf(2, "2-c"), leaf(3, "2-b")];
        let chosen = KeepWinner.resolve("doc", &leaves).unwrap().unwrap();
        assert_eq!(chosen.rev_id.as_str(), "2-c");
    }

    #[test]
    fn test_closure_resolver() {
        let leaves = vec![leaf(1, "2-a"), leaf(2, "2-b")];
        let first = |_: &str, conflicts: &[DocumentRevision]| conflicts.first().cloned();
        let chosen = first.resolve("doc", &leaves).unwrap().unwrap();
        assert_eq!(chosen.sequence, 1);

        let none = |_: &str, _: &[DocumentRevision]| None;
        assert!(none.resolve("doc", &leaves).unwrap().is_none());
    }
}
