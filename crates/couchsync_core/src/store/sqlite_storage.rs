//! SQLite-backed storage implementation for revision persistence.
//!
//! Revisions live in a single `revs` table with parent pointers. Attachment
//! metadata is stored per sequence and points at content-addressed blobs, so
//! identical content shared by many revisions is stored once.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::storage::{
    ChangeRow, CompactionStats, NewRevision, RevisionStore, StorageResult, StoreTransaction,
};
use crate::error::SyncError;
use crate::revision::{
    Attachment, DocumentBody, DocumentRevision, Encoding, RevisionId, RevisionTree,
};

/// Raw `revs` row before the revision id and body are parsed.
type RevRow = (i64, String, Option<i64>, bool, bool, bool, Vec<u8>);

/// SQLite-backed revision storage.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex`; holding it for the duration of a
/// transaction is what makes the store single-writer.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage("sqlite connection mutex poisoned".into()))
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Revision forest, one row per node
            CREATE TABLE IF NOT EXISTS revs (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                rev_id TEXT NOT NULL,
                parent INTEGER REFERENCES revs(sequence),
                deleted INTEGER NOT NULL DEFAULT 0,
                current INTEGER NOT NULL DEFAULT 0,
                available INTEGER NOT NULL DEFAULT 1,
                body BLOB NOT NULL,
                UNIQUE (doc_id, rev_id)
            );

            CREATE INDEX IF NOT EXISTS idx_revs_doc_id ON revs(doc_id);
            CREATE INDEX IF NOT EXISTS idx_revs_parent ON revs(parent);
            CREATE INDEX IF NOT EXISTS idx_revs_current ON revs(current);

            -- Attachment metadata per revision
            CREATE TABLE IF NOT EXISTS attachments (
                sequence INTEGER NOT NULL REFERENCES revs(sequence),
                name TEXT NOT NULL,
                key TEXT NOT NULL,
                content_type TEXT NOT NULL,
                length INTEGER NOT NULL,
                encoded_length INTEGER NOT NULL,
                revpos INTEGER NOT NULL,
                encoding TEXT NOT NULL,
                PRIMARY KEY (sequence, name)
            );

            -- Content-addressed attachment bytes
            CREATE TABLE IF NOT EXISTS attachment_blobs (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL
            );

            -- Local documents (checkpoints), never replicated
            CREATE TABLE IF NOT EXISTS local_docs (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl RevisionStore for SqliteStorage {
    fn with_transaction(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTransaction) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let result = f(&mut SqliteTransaction { conn: &tx });
        match result {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(e)
            }
        }
    }
}

/// A live SQLite transaction.
struct SqliteTransaction<'c> {
    conn: &'c Connection,
}

fn revision_from_row(doc_id: &str, row: RevRow) -> StorageResult<DocumentRevision> {
    let (sequence, rev_id, parent, deleted, current, available, body) = row;
    Ok(DocumentRevision {
        doc_id: doc_id.to_string(),
        rev_id: RevisionId::parse(&rev_id)?,
        sequence,
        parent,
        deleted,
        current,
        available,
        body: DocumentBody::from_bytes(&body)?,
    })
}

fn encoding_to_sql(encoding: Encoding) -> &'static str {
    match encoding {
        Encoding::Plain => "plain",
        Encoding::Gzip => "gzip",
    }
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn insert_revision(&mut self, revision: NewRevision) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO revs (doc_id, rev_id, parent, deleted, current, available, body)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                revision.doc_id,
                revision.rev_id.as_str(),
                revision.parent,
                revision.deleted,
                revision.current,
                revision.available,
                revision.body.to_bytes(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn set_current(&mut self, sequence: i64, current: bool) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE revs SET current = ? WHERE sequence = ?",
            params![current, sequence],
        )?;
        Ok(())
    }

    fn read_tree(&mut self, doc_id: &str) -> StorageResult<Option<RevisionTree>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence, rev_id, parent, deleted, current, available, body
             FROM revs WHERE doc_id = ? ORDER BY sequence ASC",
        )?;
        let rows: Vec<RevRow> = stmt
            .query_map(params![doc_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<Result<_, _>>()?;

        if rows.is_empty() {
            return Ok(None);
        }
        let mut tree = RevisionTree::new(doc_id);
        for row in rows {
            tree.add(revision_from_row(doc_id, row)?)?;
        }
        Ok(Some(tree))
    }

    fn last_sequence(&mut self) -> StorageResult<i64> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(sequence) FROM revs", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }

    fn changes_since(&mut self, since: i64, limit: usize) -> StorageResult<Vec<ChangeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT doc_id, MAX(sequence) AS seq FROM revs
             GROUP BY doc_id HAVING seq > ?
             ORDER BY seq ASC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![since, limit as i64], |row| {
                Ok(ChangeRow {
                    doc_id: row.get(0)?,
                    sequence: row.get(1)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    fn doc_ids(&mut self) -> StorageResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT doc_id FROM revs ORDER BY doc_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    fn conflicted_doc_ids(&mut self) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT doc_id FROM revs r
             WHERE deleted = 0
               AND NOT EXISTS (SELECT 1 FROM revs c WHERE c.parent = r.sequence)
             GROUP BY doc_id HAVING COUNT(*) > 1
             ORDER BY doc_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(ids)
    }

    fn attachments(&mut self, sequence: i64) -> StorageResult<Vec<Attachment>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, key, content_type, length, encoded_length, revpos, encoding
             FROM attachments WHERE sequence = ? ORDER BY name",
        )?;
        let attachments = stmt
            .query_map(params![sequence], |row| {
                let encoding: String = row.get(6)?;
                Ok(Attachment {
                    name: row.get(0)?,
                    key: row.get(1)?,
                    content_type: row.get(2)?,
                    length: row.get::<_, i64>(3)? as u64,
                    encoded_length: row.get::<_, i64>(4)? as u64,
                    revpos: row.get::<_, i64>(5)? as u64,
                    encoding: Encoding::from_wire(Some(encoding.as_str())),
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(attachments)
    }

    fn attachment_data(&mut self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let data = self
            .conn
            .query_row(
                "SELECT data FROM attachment_blobs WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(data)
    }

    fn put_attachment_data(&mut self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO attachment_blobs (key, data) VALUES (?, ?)",
            params![key, data],
        )?;
        Ok(())
    }

    fn add_attachment(&mut self, sequence: i64, attachment: &Attachment) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO attachments
                (sequence, name, key, content_type, length, encoded_length, revpos, encoding)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                sequence,
                attachment.name,
                attachment.key,
                attachment.content_type,
                attachment.length as i64,
                attachment.encoded_length as i64,
                attachment.revpos as i64,
                encoding_to_sql(attachment.encoding),
            ],
        )?;
        Ok(())
    }

    fn get_local(&mut self, id: &str) -> StorageResult<Option<Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM local_docs WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn put_local(&mut self, id: &str, body: &Value) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO local_docs (id, body) VALUES (?, ?)",
            params![id, serde_json::to_string(body)?],
        )?;
        Ok(())
    }

    fn delete_local(&mut self, id: &str) -> StorageResult<bool> {
        let n = self
            .conn
            .execute("DELETE FROM local_docs WHERE id = ?", params![id])?;
        Ok(n > 0)
    }

    fn compact(&mut self) -> StorageResult<CompactionStats> {
        let revisions = self.conn.execute(
            "UPDATE revs SET body = X'', available = 0
             WHERE available = 1
               AND sequence IN (SELECT parent FROM revs WHERE parent IS NOT NULL)",
            [],
        )?;
        self.conn.execute(
            "DELETE FROM attachments
             WHERE sequence IN (SELECT sequence FROM revs WHERE available = 0)",
            [],
        )?;
        let blobs = self.conn.execute(
            "DELETE FROM attachment_blobs WHERE key NOT IN (SELECT key FROM attachments)",
            [],
        )?;
        Ok(CompactionStats { revisions, blobs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::attachment_key;
    use serde_json::json;

    fn rev(doc: &str, rev_id: &str, parent: Option<i64>, deleted: bool) -> NewRevision {
        NewRevision {
            doc_id: doc.into(),
            rev_id: RevisionId::parse(rev_id).unwrap(),
            parent,
            deleted,
            current: false,
            available: true,
            body: DocumentBody::from_value(json!({"rev": rev_id})).unwrap(),
        }
    }

    #[test]
    fn test_sqlite_insert_and_read_tree() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .with_transaction(&mut |txn| {
                let root = txn.insert_revision(rev("a", "1-x", None, false))?;
                let child = txn.insert_revision(rev("a", "2-y", Some(root), false))?;
                txn.set_current(child, true)?;
                Ok(())
            })
            .unwrap();

        storage
            .with_transaction(&mut |txn| {
                let tree = txn.read_tree("a")?.unwrap();
                assert_eq!(tree.len(), 2);
                let leaf = tree.current_revision().unwrap();
                assert_eq!(leaf.rev_id.as_str(), "2-y");
                assert!(leaf.current);
                assert_eq!(leaf.body.get("rev"), Some(&json!("2-y")));
                assert!(txn.read_tree("missing")?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sqlite_rollback_on_error() {
        let storage = SqliteStorage::in_memory().unwrap();
        let result = storage.with_transaction(&mut |txn| {
            txn.insert_revision(rev("a", "1-x", None, false))?;
            Err(SyncError::Storage("boom".into()))
        });
        assert!(result.is_err());

        storage
            .with_transaction(&mut |txn| {
                assert!(txn.read_tree("a")?.is_none());
                assert_eq!(txn.last_sequence()?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sqlite_duplicate_revision_rejected() {
        let storage = SqliteStorage::in_memory().unwrap();
        let result = storage.with_transaction(&mut |txn| {
            txn.insert_revision(rev("a", "1-x", None, false))?;
            txn.insert_revision(rev("a", "1-x", None, false))?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_sqlite_changes_and_conflicts() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .with_transaction(&mut |txn| {
                let a1 = txn.insert_revision(rev("a", "1-x", None, false))?;
                txn.insert_revision(rev("b", "1-x", None, false))?;
                txn.insert_revision(rev("a", "2-y", Some(a1), false))?;
                txn.insert_revision(rev("a", "2-z", Some(a1), false))?;
                Ok(())
            })
            .unwrap();

        storage
            .with_transaction(&mut |txn| {
                let changes = txn.changes_since(0, 10)?;
                let ids: Vec<_> = changes.iter().map(|c| c.doc_id.as_str()).collect();
                assert_eq!(ids, vec!["b", "a"]);
                assert_eq!(changes[1].sequence, 4);
                assert_eq!(txn.changes_since(2, 10)?.len(), 1);
                assert_eq!(txn.conflicted_doc_ids()?, vec!["a".to_string()]);
                assert_eq!(txn.doc_ids()?, vec!["a".to_string(), "b".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sqlite_attachments_and_compaction() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .with_transaction(&mut |txn| {
                let data = b"old bytes";
                let key = attachment_key(data);
                txn.put_attachment_data(&key, data)?;
                let root = txn.insert_revision(rev("a", "1-x", None, false))?;
                txn.add_attachment(
                    root,
                    &Attachment {
                        name: "file.txt".into(),
                        key: key.clone(),
                        content_type: "text/plain".into(),
                        length: data.len() as u64,
                        encoded_length: data.len() as u64,
                        revpos: 1,
                        encoding: Encoding::Plain,
                    },
                )?;
                txn.insert_revision(rev("a", "2-y", Some(root), false))?;
                assert_eq!(txn.attachments(root)?.len(), 1);
                assert_eq!(txn.attachment_data(&key)?.unwrap(), data.to_vec());

                let stats = txn.compact()?;
                assert_eq!(stats.revisions, 1);
                assert_eq!(stats.blobs, 1);
                assert!(txn.attachments(root)?.is_empty());

                let tree = txn.read_tree("a")?.unwrap();
                let compacted = tree.by_sequence(root).unwrap();
                assert!(compacted.is_stub());
                assert!(compacted.body.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sqlite_local_docs() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .with_transaction(&mut |txn| {
                assert!(txn.get_local("cp")?.is_none());
                txn.put_local("cp", &json!({"lastSequence": "5"}))?;
                assert_eq!(txn.get_local("cp")?, Some(json!({"lastSequence": "5"})));
                assert!(txn.delete_local("cp")?);
                assert!(!txn.delete_local("cp")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_sqlite_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage
                .with_transaction(&mut |txn| {
                    txn.insert_revision(rev("a", "1-x", None, false))?;
                    Ok(())
                })
                .unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        storage
            .with_transaction(&mut |txn| {
                assert_eq!(txn.last_sequence()?, 1);
                Ok(())
            })
            .unwrap();
    }
}
