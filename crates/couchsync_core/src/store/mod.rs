//! Storage engines for revisions, attachments and local documents.

mod memory_storage;
#[cfg(feature = "sqlite")]
mod sqlite_storage;
mod storage;

pub use memory_storage::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
pub use storage::{
    ChangeRow, CompactionStats, NewRevision, RevisionStore, StorageResult, StoreTransaction,
};
