use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for datastore and replication operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// The write does not fit the document's current revision tree.
    #[error("Conflict on document '{doc_id}': {reason}")]
    Conflict {
        /// Document id.
        doc_id: String,
        /// What clashed.
        reason: String,
    },

    /// No revision tree exists for the id.
    #[error("Document not found: '{0}'")]
    DocumentNotFound(String),

    /// The document exists but the revision does not.
    #[error("Revision '{rev_id}' not found for document '{doc_id}'")]
    RevisionNotFound {
        /// Document id.
        doc_id: String,
        /// Missing revision.
        rev_id: String,
    },

    /// Malformed caller input or wire data.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Attachment content could not be stored or resolved.
    #[error("Attachment '{name}' of document '{doc_id}' failed: {reason}")]
    Attachment {
        /// Owning document.
        doc_id: String,
        /// Attachment name.
        name: String,
        /// Failure detail.
        reason: String,
    },

    /// The remote answered 404 for the database itself.
    #[error("Remote database not found: '{0}'")]
    DatabaseNotFound(String),

    /// Any other non-2xx answer.
    #[error("HTTP {status} from remote: {message}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// Connection or protocol failure below HTTP.
    #[cfg(feature = "http")]
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The run observed its cancel token.
    #[error("Replication cancelled")]
    Cancelled,

    /// SQLite failure.
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Backend failure without a more specific source.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Body (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for [`crate::config::ReplicationConfig`].
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Config could not be written back as TOML.
    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// The platform has no config directory.
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Result type alias for datastore and replication operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub(crate) fn conflict(doc_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Conflict {
            doc_id: doc_id.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn attachment(
        doc_id: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        SyncError::Attachment {
            doc_id: doc_id.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the operation from its last good state.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Conflict { .. } | SyncError::Http { .. } | SyncError::Io(_) => true,
            #[cfg(feature = "http")]
            SyncError::Transport(_) => true,
            _ => false,
        }
    }

    /// Convert to a serializable representation for events and IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of [`SyncError`], carried by `Errored` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&SyncError> for SerializableError {
    fn from(err: &SyncError) -> Self {
        let kind = match err {
            SyncError::Conflict { .. } => "Conflict",
            SyncError::DocumentNotFound(_) => "DocumentNotFound",
            SyncError::RevisionNotFound { .. } => "RevisionNotFound",
            SyncError::InvalidArgument(_) => "InvalidArgument",
            SyncError::Attachment { .. } => "Attachment",
            SyncError::DatabaseNotFound(_) => "DatabaseNotFound",
            SyncError::Http { .. } => "Http",
            #[cfg(feature = "http")]
            SyncError::Transport(_) => "Transport",
            SyncError::Cancelled => "Cancelled",
            #[cfg(feature = "sqlite")]
            SyncError::Database(_) => "Database",
            SyncError::Storage(_) => "Storage",
            SyncError::Json(_) => "Json",
            SyncError::Io(_) => "Io",
            SyncError::ConfigParse(_) => "ConfigParse",
            SyncError::ConfigSerialize(_) => "ConfigSerialize",
            SyncError::NoConfigDir => "NoConfigDir",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<SyncError> for SerializableError {
    fn from(err: SyncError) -> Self {
        SerializableError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializable_error_kind() {
        let err = SyncError::DatabaseNotFound("http://localhost/db".into());
        let ser = err.to_serializable();
        assert_eq!(ser.kind, "DatabaseNotFound");
        assert!(ser.message.contains("http://localhost/db"));
    }

    #[test]
    fn test_conflict_is_retryable() {
        assert!(SyncError::conflict("doc", "tree changed").is_retryable());
        assert!(!SyncError::InvalidArgument("bad".into()).is_retryable());
    }
}
