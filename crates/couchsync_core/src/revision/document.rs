//! Document revisions, bodies and attachment metadata.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::rev_id::RevisionId;
use crate::error::{Result, SyncError};

/// JSON object body of a revision.
///
/// Keys starting with `_` are reserved for CouchDB metadata and are stripped
/// when a body is built from a wire document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentBody(Map<String, Value>);

impl DocumentBody {
    /// An empty body, used for stubs and deletions.
    pub fn empty() -> Self {
        Self(Map::new())
    }

    /// Build a body from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SyncError::InvalidArgument(format!(
                "document body must be a JSON object, got {other}"
            ))),
        }
    }

    /// Build a body from a wire document, dropping `_`-prefixed fields.
    pub fn from_wire(mut map: Map<String, Value>) -> Self {
        map.retain(|key, _| !key.starts_with('_'));
        Self(map)
    }

    /// Canonical serialized form. Object keys are sorted.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    /// Parse a stored body. Empty input yields an empty body.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        Ok(Self(serde_json::from_slice(bytes)?))
    }

    /// Consume into the underlying map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl Deref for DocumentBody {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DocumentBody {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// One node of a document's revision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRevision {
    /// Document id, stable across revisions.
    pub doc_id: String,
    /// Revision id, unique within the document.
    pub rev_id: RevisionId,
    /// Store-assigned sequence. Also the node id within the tree.
    pub sequence: i64,
    /// Sequence of the parent node, `None` for a root.
    pub parent: Option<i64>,
    /// Tombstone marker.
    pub deleted: bool,
    /// Whether this is the document's winning revision.
    pub current: bool,
    /// False for stubs, whose body is not stored locally.
    pub available: bool,
    /// Revision body. Empty for stubs, deletions and compacted revisions.
    pub body: DocumentBody,
}

impl DocumentRevision {
    /// Generation of this revision.
    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    /// Whether the revision is a stub placeholder.
    pub fn is_stub(&self) -> bool {
        !self.available
    }
}

/// Content encoding of stored attachment bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Stored as received.
    #[default]
    Plain,
    /// Gzip-compressed; `length` is the decoded size.
    Gzip,
}

impl Encoding {
    /// Parse the `encoding` field of a CouchDB attachment stub.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("gzip") => Encoding::Gzip,
            _ => Encoding::Plain,
        }
    }
}

/// Attachment metadata stored against a revision sequence.
///
/// Content lives in a shared blob table keyed by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment name, unique within a revision.
    pub name: String,
    /// SHA-256 hex of the stored bytes.
    pub key: String,
    /// MIME type.
    pub content_type: String,
    /// Decoded length.
    pub length: u64,
    /// Length of the stored (possibly encoded) bytes.
    pub encoded_length: u64,
    /// Generation of the revision that last changed the content.
    pub revpos: u64,
    /// Encoding of the stored bytes.
    pub encoding: Encoding,
}

impl Attachment {
    /// CouchDB-style digest string for this attachment.
    pub fn digest(&self) -> String {
        format!("sha256-{}", self.key)
    }
}

/// New attachment content supplied by a local write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsavedAttachment {
    /// Attachment name.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Raw content.
    pub data: Vec<u8>,
}

impl UnsavedAttachment {
    /// Create an attachment from raw bytes.
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            data,
        }
    }
}

/// Attachment accompanying a revision received from a remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingAttachment {
    /// Unchanged since an ancestor: copy content forward from it.
    Stub {
        /// Attachment name.
        name: String,
        /// Generation that last changed the content.
        revpos: u64,
    },
    /// Full content.
    Data {
        /// Attachment name.
        name: String,
        /// MIME type.
        content_type: String,
        /// Generation that last changed the content.
        revpos: u64,
        /// Encoding of `data`.
        encoding: Encoding,
        /// Decoded length as declared by the sender.
        length: u64,
        /// Content as sent, still encoded if `encoding` says so.
        data: Vec<u8>,
    },
}

impl IncomingAttachment {
    /// Attachment name.
    pub fn name(&self) -> &str {
        match self {
            IncomingAttachment::Stub { name, .. } | IncomingAttachment::Data { name, .. } => name,
        }
    }
}

/// Stored content key for attachment bytes.
pub fn attachment_key(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_from_value_requires_object() {
        assert!(DocumentBody::from_value(json!({"a": 1})).is_ok());
        assert!(DocumentBody::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_body_from_wire_strips_reserved_fields() {
        let map = json!({"_id": "x", "_rev": "1-a", "title": "t"});
        let body = DocumentBody::from_wire(map.as_object().cloned().unwrap());
        assert_eq!(body.len(), 1);
        assert_eq!(body.get("title"), Some(&json!("t")));
    }

    #[test]
    fn test_body_bytes_are_canonical() {
        let a = DocumentBody::from_value(json!({"b": 1, "a": 2})).unwrap();
        let b = DocumentBody::from_value(json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(DocumentBody::from_bytes(&a.to_bytes()).unwrap(), a);
        assert!(DocumentBody::from_bytes(b"").unwrap().is_empty());
    }

    #[test]
    fn test_attachment_key_is_content_addressed() {
        assert_eq!(attachment_key(b"hello"), attachment_key(b"hello"));
        assert_ne!(attachment_key(b"hello"), attachment_key(b"world"));
    }
}
