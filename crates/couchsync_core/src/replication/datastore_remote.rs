//! A local [`Datastore`] seen through the [`RemoteDatabase`] trait.
//!
//! Lets two datastores in the same process replicate with the same
//! strategies used against CouchDB.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Value, json};

use super::multipart::{MultipartBody, MultipartPart};
use super::remote::{
    ChangeEntry, ChangeRev, ChangesFeed, DocumentRevs, RemoteDatabase, Revisions, RevsDiffEntry,
    WireAttachment,
};
use crate::config::PullFilter;
use crate::datastore::{Datastore, ForceInsertItem, POSSIBLE_ANCESTORS_LIMIT};
use crate::error::{Result, SyncError};
use crate::revision::{Encoding, IncomingAttachment, RevisionId};

/// Adapter exposing a [`Datastore`] as a replication peer.
#[derive(Debug, Clone)]
pub struct DatastoreRemote {
    datastore: Arc<Datastore>,
}

impl DatastoreRemote {
    /// Wrap a shared datastore.
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self { datastore }
    }

    /// The wrapped datastore.
    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }
}

fn parse_since(since: Option<&str>) -> Result<i64> {
    match since {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| SyncError::InvalidArgument(format!("invalid sequence '{raw}'"))),
    }
}

/// Turn a received wire document into a force-insert item.
///
/// Attachments marked `follows` take their bytes from `parts`, matched by
/// filename when the part carries one and by position otherwise.
fn into_item(doc: DocumentRevs, parts: &mut Vec<MultipartPart>) -> Result<ForceInsertItem> {
    let history = doc.history()?;
    let mut attachments = Vec::with_capacity(doc.attachments.len());
    for (name, wire) in &doc.attachments {
        let incoming = if wire.follows {
            let index = parts
                .iter()
                .position(|p| p.name.as_deref() == Some(name.as_str()))
                .or_else(|| (!parts.is_empty()).then_some(0))
                .ok_or_else(|| SyncError::attachment(&doc.id, name, "no multipart part follows"))?;
            let part = parts.remove(index);
            IncomingAttachment::Data {
                name: name.clone(),
                content_type: wire.content_type.clone(),
                revpos: wire.revpos,
                encoding: Encoding::from_wire(wire.encoding.as_deref()),
                length: wire.length.unwrap_or(part.data.len() as u64),
                data: part.data,
            }
        } else if let Some(decoded) = wire.decode_data() {
            let data = decoded
                .map_err(|e| SyncError::attachment(&doc.id, name, format!("invalid base64: {e}")))?;
            IncomingAttachment::Data {
                name: name.clone(),
                content_type: wire.content_type.clone(),
                revpos: wire.revpos,
                encoding: Encoding::from_wire(wire.encoding.as_deref()),
                length: wire.length.unwrap_or(data.len() as u64),
                data,
            }
        } else {
            IncomingAttachment::Stub {
                name: name.clone(),
                revpos: wire.revpos,
            }
        };
        attachments.push(incoming);
    }
    Ok(ForceInsertItem::new(doc.id, history, doc.body, doc.deleted).with_attachments(attachments))
}

impl RemoteDatabase for DatastoreRemote {
    fn identifier(&self) -> String {
        format!("local:{}", self.datastore.name())
    }

    fn exists(&self) -> Result<bool> {
        Ok(true)
    }

    fn create(&self) -> Result<()> {
        Ok(())
    }

    fn changes(
        &self,
        since: Option<&str>,
        limit: usize,
        filter: Option<&PullFilter>,
    ) -> Result<ChangesFeed> {
        if let Some(filter) = filter {
            return Err(SyncError::InvalidArgument(format!(
                "filter '{}' is not supported by local datastores",
                filter.name
            )));
        }
        let page = self.datastore.changes(parse_since(since)?, limit)?;
        let results = page
            .results
            .into_iter()
            .map(|change| ChangeEntry {
                id: change.revision.doc_id,
                seq: json!(change.sequence),
                changes: change.leaves.into_iter().map(|rev| ChangeRev { rev }).collect(),
                deleted: change.revision.deleted,
            })
            .collect();
        Ok(ChangesFeed {
            results,
            last_seq: json!(page.last_sequence),
        })
    }

    fn revs_diff(
        &self,
        revisions: &BTreeMap<String, BTreeSet<RevisionId>>,
    ) -> Result<BTreeMap<String, RevsDiffEntry>> {
        let missing = self.datastore.revs_diff(revisions)?;
        let mut diff = BTreeMap::new();
        for (doc_id, revs) in missing {
            let mut ancestors = BTreeSet::new();
            for rev in &revs {
                ancestors.extend(
                    self.datastore
                        .possible_ancestors(&doc_id, rev, POSSIBLE_ANCESTORS_LIMIT)?,
                );
            }
            diff.insert(
                doc_id,
                RevsDiffEntry {
                    missing: revs.into_iter().collect(),
                    possible_ancestors: ancestors
                        .into_iter()
                        .rev()
                        .take(POSSIBLE_ANCESTORS_LIMIT)
                        .collect(),
                },
            );
        }
        Ok(diff)
    }

    fn open_revisions(
        &self,
        doc_id: &str,
        revs: &[RevisionId],
        atts_since: &[RevisionId],
        attachments: bool,
    ) -> Result<Vec<DocumentRevs>> {
        let tree = self.datastore.get_all_revisions(doc_id)?;
        let known: BTreeSet<&RevisionId> = atts_since.iter().collect();
        let mut docs = Vec::with_capacity(revs.len());

        for rev in revs {
            let Some(node) = tree.lookup(rev).filter(|n| n.available) else {
                log::debug!("[DatastoreRemote] {} {} not available", doc_id, rev);
                continue;
            };
            let path = tree.path_revision_ids(node.sequence);
            let since_generation = path
                .iter()
                .filter(|r| known.contains(r))
                .map(RevisionId::generation)
                .max();

            let mut wire_attachments = BTreeMap::new();
            for attachment in self.datastore.attachments(node.sequence)? {
                let mut wire = WireAttachment {
                    content_type: attachment.content_type.clone(),
                    revpos: attachment.revpos,
                    digest: Some(attachment.digest()),
                    length: Some(attachment.length),
                    encoding: (attachment.encoding == Encoding::Gzip).then(|| "gzip".to_string()),
                    ..Default::default()
                };
                let unchanged = since_generation.is_some_and(|g| g >= attachment.revpos);
                if attachments && !unchanged {
                    let data = self.datastore.attachment_data(doc_id, &attachment)?;
                    wire.data = Some(WireAttachment::encode_data(&data));
                } else {
                    wire.stub = true;
                }
                wire_attachments.insert(attachment.name.clone(), wire);
            }

            docs.push(DocumentRevs {
                id: doc_id.to_string(),
                rev: node.rev_id.clone(),
                deleted: node.deleted,
                revisions: Revisions::from_path(&path),
                attachments: wire_attachments,
                body: node.body.clone(),
            });
        }
        Ok(docs)
    }

    fn get_attachment(&self, doc_id: &str, rev: &RevisionId, name: &str) -> Result<Vec<u8>> {
        let tree = self.datastore.get_all_revisions(doc_id)?;
        let node = tree.lookup(rev).ok_or_else(|| SyncError::RevisionNotFound {
            doc_id: doc_id.to_string(),
            rev_id: rev.to_string(),
        })?;
        let attachment = self
            .datastore
            .attachments(node.sequence)?
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| SyncError::attachment(doc_id, name, format!("not present on {rev}")))?;
        self.datastore.attachment_data(doc_id, &attachment)
    }

    fn bulk_docs(&self, docs: &[Value]) -> Result<()> {
        let mut no_parts = Vec::new();
        let items = docs
            .iter()
            .map(|doc| into_item(DocumentRevs::from_json(doc.clone())?, &mut no_parts))
            .collect::<Result<Vec<_>>>()?;
        self.datastore.force_insert(&items)?;
        Ok(())
    }

    fn put_multipart(&self, doc_id: &str, body: &MultipartBody) -> Result<()> {
        let (json, mut parts) = body.parse()?;
        let doc = DocumentRevs::from_json(json)?;
        if doc.id != doc_id {
            return Err(SyncError::InvalidArgument(format!(
                "multipart body is for '{}', not '{}'",
                doc.id, doc_id
            )));
        }
        let item = into_item(doc, &mut parts)?;
        self.datastore.force_insert(&[item])?;
        Ok(())
    }

    fn get_checkpoint(&self, replication_id: &str) -> Result<Option<String>> {
        self.datastore.get_checkpoint(replication_id)
    }

    fn put_checkpoint(&self, replication_id: &str, sequence: &str) -> Result<()> {
        self.datastore.put_checkpoint(replication_id, sequence)
    }
}
