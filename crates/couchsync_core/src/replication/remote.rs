//! Remote database abstraction and CouchDB wire types.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::multipart::MultipartBody;
use crate::config::PullFilter;
use crate::error::{Result, SyncError};
use crate::revision::{DocumentBody, RevisionId};

/// Trait for CouchDB-compatible databases that replication talks to.
///
/// Every method is a blocking call. Implementations must be shareable across
/// the pull worker pool.
pub trait RemoteDatabase: Send + Sync {
    /// Stable identifier used when deriving replication ids (usually the URL)
    fn identifier(&self) -> String;

    /// Whether the database exists
    fn exists(&self) -> Result<bool>;

    /// Create the database if it is missing
    fn create(&self) -> Result<()>;

    /// One page of the changes feed (`style=all_docs`)
    fn changes(
        &self,
        since: Option<&str>,
        limit: usize,
        filter: Option<&PullFilter>,
    ) -> Result<ChangesFeed>;

    /// Which of the given revisions the database lacks
    fn revs_diff(
        &self,
        revisions: &BTreeMap<String, BTreeSet<RevisionId>>,
    ) -> Result<BTreeMap<String, RevsDiffEntry>>;

    /// Fetch the given open revisions with their full history.
    ///
    /// Attachments unchanged since any revision in `atts_since` come back as
    /// stubs. Other attachments carry inline data when `attachments` is set.
    fn open_revisions(
        &self,
        doc_id: &str,
        revs: &[RevisionId],
        atts_since: &[RevisionId],
        attachments: bool,
    ) -> Result<Vec<DocumentRevs>>;

    /// Download one attachment of a revision
    fn get_attachment(&self, doc_id: &str, rev: &RevisionId, name: &str) -> Result<Vec<u8>>;

    /// Store revisions as-is (`new_edits: false`)
    fn bulk_docs(&self, docs: &[Value]) -> Result<()>;

    /// Store one revision whose attachments travel as `multipart/related`
    fn put_multipart(&self, doc_id: &str, body: &MultipartBody) -> Result<()>;

    /// Read the checkpoint stored under `_local/<replication_id>`
    fn get_checkpoint(&self, replication_id: &str) -> Result<Option<String>>;

    /// Write the checkpoint stored under `_local/<replication_id>`
    fn put_checkpoint(&self, replication_id: &str, sequence: &str) -> Result<()>;
}

/// Response of `GET /_changes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesFeed {
    /// Change rows in sequence order.
    pub results: Vec<ChangeEntry>,
    /// Opaque sequence to resume from.
    pub last_seq: Value,
}

/// One row of the changes feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Document id.
    pub id: String,
    /// Opaque sequence of the row.
    pub seq: Value,
    /// Leaf revisions of the document.
    pub changes: Vec<ChangeRev>,
    /// Whether the winner is a tombstone.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// A leaf revision listed by a change row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    /// Leaf revision id.
    pub rev: RevisionId,
}

/// Per-document answer of `POST /_revs_diff`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    /// Revisions the target lacks.
    #[serde(default)]
    pub missing: Vec<RevisionId>,
    /// Revisions the target holds that could be ancestors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<RevisionId>,
}

/// The `_revisions` field: newest suffix first, counting down from `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    /// Generation of the first id.
    pub start: u64,
    /// Revision suffixes, newest first.
    pub ids: Vec<String>,
}

impl Revisions {
    /// Encode a leaf-first path of revision ids.
    pub fn from_path(path: &[RevisionId]) -> Self {
        Self {
            start: path.first().map_or(0, |r| r.generation()),
            ids: path.iter().map(|r| r.suffix().to_string()).collect(),
        }
    }

    /// Decode into a root-ward-first history.
    pub fn to_history(&self) -> Result<Vec<RevisionId>> {
        if self.ids.len() as u64 > self.start {
            return Err(SyncError::InvalidArgument(format!(
                "_revisions lists {} ids but starts at generation {}",
                self.ids.len(),
                self.start
            )));
        }
        let mut history = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| RevisionId::parse(&format!("{}-{}", self.start - i as u64, id)))
            .collect::<Result<Vec<_>>>()?;
        history.reverse();
        Ok(history)
    }
}

/// Attachment entry of a wire document's `_attachments`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAttachment {
    /// MIME type.
    pub content_type: String,
    /// Generation that last changed the content.
    pub revpos: u64,
    /// `sha256-` or `md5-` digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Decoded length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Content omitted; inherited from `revpos`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
    /// Content follows in a multipart part.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub follows: bool,
    /// Base64 content when inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// `gzip` when the content is compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl WireAttachment {
    /// Decode inline data, if present.
    pub fn decode_data(&self) -> Option<std::result::Result<Vec<u8>, base64::DecodeError>> {
        self.data.as_deref().map(|d| BASE64.decode(d))
    }

    /// Encode bytes as inline data.
    pub fn encode_data(data: &[u8]) -> String {
        BASE64.encode(data)
    }
}

/// One revision as exchanged with a remote: metadata plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRevs {
    /// Document id.
    pub id: String,
    /// Revision id.
    pub rev: RevisionId,
    /// Tombstone flag.
    pub deleted: bool,
    /// Ancestry of `rev`.
    pub revisions: Revisions,
    /// Attachments by name.
    pub attachments: BTreeMap<String, WireAttachment>,
    /// Body without `_`-prefixed fields.
    pub body: DocumentBody,
}

impl DocumentRevs {
    /// Parse a wire document (`_id`, `_rev`, `_revisions`, ...).
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(SyncError::InvalidArgument(
                "wire document must be a JSON object".into(),
            ));
        };
        let id = match map.remove("_id") {
            Some(Value::String(id)) => id,
            _ => return Err(SyncError::InvalidArgument("wire document lacks _id".into())),
        };
        let rev = match map.remove("_rev") {
            Some(Value::String(rev)) => RevisionId::parse(&rev)?,
            _ => {
                return Err(SyncError::InvalidArgument(format!(
                    "wire document '{id}' lacks _rev"
                )));
            }
        };
        let deleted = matches!(map.remove("_deleted"), Some(Value::Bool(true)));
        let revisions = match map.remove("_revisions") {
            Some(v) => serde_json::from_value(v)?,
            None => Revisions {
                start: rev.generation(),
                ids: vec![rev.suffix().to_string()],
            },
        };
        let attachments = match map.remove("_attachments") {
            Some(v) => serde_json::from_value(v)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            id,
            rev,
            deleted,
            revisions,
            attachments,
            body: DocumentBody::from_wire(map),
        })
    }

    /// Serialize as a wire document.
    pub fn to_json(&self) -> Value {
        let mut map: Map<String, Value> = self.body.clone().into_inner();
        map.insert("_id".into(), json!(self.id));
        map.insert("_rev".into(), json!(self.rev));
        if self.deleted {
            map.insert("_deleted".into(), json!(true));
        }
        map.insert("_revisions".into(), json!(self.revisions));
        if !self.attachments.is_empty() {
            map.insert("_attachments".into(), json!(self.attachments));
        }
        Value::Object(map)
    }

    /// Root-ward-first history ending at `rev`.
    pub fn history(&self) -> Result<Vec<RevisionId>> {
        let history = self.revisions.to_history()?;
        if history.last() != Some(&self.rev) {
            return Err(SyncError::InvalidArgument(format!(
                "_revisions of '{}' does not end at {}",
                self.id, self.rev
            )));
        }
        Ok(history)
    }
}

/// Render an opaque sequence value as a checkpoint string.
pub fn sequence_to_string(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
