//! Local-to-remote replication.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use super::multipart::{MultipartBody, MultipartWriter};
use super::remote::{DocumentRevs, RemoteDatabase, Revisions, WireAttachment};
use super::{CancelFlag, ReplicationStrategy, ReplicationSummary, hash_identity};
use crate::config::PushSettings;
use crate::datastore::{Change, Datastore};
use crate::error::{Result, SyncError};
use crate::events::{EventRegistry, ReplicationEvent};
use crate::revision::{DocumentRevision, Encoding, RevisionId, RevisionTree};

/// A revision ready for upload.
#[derive(Debug)]
enum Outgoing {
    /// Goes to `_bulk_docs`, attachments inline or stubbed.
    Bulk(Value),
    /// Carries attachments as `multipart/related` parts.
    Multipart(String, MultipartBody),
}

/// Client-side filter choosing which changed documents a push sends.
///
/// The predicate sees the winning revision of each changed document. The
/// name is part of the replication id, so runs with different filters keep
/// separate checkpoints.
#[derive(Clone)]
pub struct PushFilter {
    name: String,
    predicate: Arc<dyn Fn(&DocumentRevision) -> bool + Send + Sync>,
}

impl PushFilter {
    /// Create a filter named `name`.
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&DocumentRevision) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Name recorded in the replication id.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `revision`'s document should be pushed.
    pub fn should_replicate(&self, revision: &DocumentRevision) -> bool {
        (self.predicate)(revision)
    }
}

impl std::fmt::Debug for PushFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushFilter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn push_replication_id(
    source: &Datastore,
    target: &dyn RemoteDatabase,
    filter: Option<&PushFilter>,
) -> String {
    hash_identity(
        &format!("local:{}", source.name()),
        &target.identifier(),
        filter.map(|f| json!({ "name": f.name })),
    )
}

/// Pushes local changes to a remote database.
pub struct PushStrategy {
    source: Arc<Datastore>,
    target: Arc<dyn RemoteDatabase>,
    settings: PushSettings,
    filter: Option<PushFilter>,
    replication_id: String,
    cancel: CancelFlag,
    progress: Mutex<Option<Arc<EventRegistry<ReplicationEvent>>>>,
}

impl PushStrategy {
    /// Create a push from `source` to `target`.
    pub fn new(source: Arc<Datastore>, target: Arc<dyn RemoteDatabase>, settings: PushSettings) -> Self {
        let replication_id = push_replication_id(&source, &*target, None);
        Self {
            source,
            target,
            settings,
            filter: None,
            replication_id,
            cancel: CancelFlag::new(),
            progress: Mutex::new(None),
        }
    }

    /// Only push documents accepted by `filter`.
    pub fn with_filter(mut self, filter: PushFilter) -> Self {
        self.replication_id = push_replication_id(&self.source, &*self.target, Some(&filter));
        self.filter = Some(filter);
        self
    }

    fn read_checkpoint(&self) -> Result<i64> {
        let Some(raw) = self.target.get_checkpoint(&self.replication_id)? else {
            return Ok(0);
        };
        Ok(raw.parse().unwrap_or_else(|_| {
            log::warn!("[PushStrategy] ignoring unreadable checkpoint {:?}", raw);
            0
        }))
    }

    /// Upload one page of local changes. Returns the number of revisions sent.
    fn push_batch(&self, changes: &[Change]) -> Result<usize> {
        let mut sent = 0;
        for chunk in changes.chunks(self.settings.bulk_insert_size.max(1)) {
            if self.is_cancelled() {
                break;
            }
            let open: BTreeMap<String, BTreeSet<RevisionId>> = chunk
                .iter()
                .map(|c| (c.revision.doc_id.clone(), c.leaves.clone()))
                .collect();
            let diff = self.target.revs_diff(&open)?;

            let mut bulk = Vec::new();
            let mut multipart = Vec::new();
            for (doc_id, entry) in diff {
                if entry.missing.is_empty() {
                    continue;
                }
                let tree = self.source.get_all_revisions(&doc_id)?;
                let ancestors: BTreeSet<&RevisionId> = entry.possible_ancestors.iter().collect();
                for rev in &entry.missing {
                    let Some(node) = tree.lookup(rev) else {
                        log::warn!("[PushStrategy] remote asked for unknown {} {}", doc_id, rev);
                        continue;
                    };
                    if !node.available {
                        log::debug!("[PushStrategy] skipping stub {} {}", doc_id, rev);
                        continue;
                    }
                    match self.encode_revision(&tree, node, &ancestors)? {
                        Outgoing::Bulk(doc) => bulk.push(doc),
                        Outgoing::Multipart(doc_id, body) => multipart.push((doc_id, body)),
                    }
                }
            }

            for (doc_id, body) in &multipart {
                self.target.put_multipart(doc_id, body)?;
            }
            if !bulk.is_empty() {
                self.target.bulk_docs(&bulk)?;
            }
            log::debug!(
                "[PushStrategy] sent {} bulk and {} multipart revisions",
                bulk.len(),
                multipart.len()
            );
            sent += bulk.len() + multipart.len();
        }
        Ok(sent)
    }

    /// Serialize `node` with its ancestry and attachments.
    ///
    /// Attachments the remote already holds (revpos at or below its nearest
    /// known ancestor) are stubbed. New ones go inline or as multipart parts
    /// according to the inline policy.
    fn encode_revision(
        &self,
        tree: &RevisionTree,
        node: &DocumentRevision,
        possible_ancestors: &BTreeSet<&RevisionId>,
    ) -> Result<Outgoing> {
        let path = tree.path_revision_ids(node.sequence);
        let min_revpos = path
            .iter()
            .find(|rev| possible_ancestors.contains(rev))
            .map_or(0, |rev| rev.generation());

        let mut doc = DocumentRevs {
            id: node.doc_id.clone(),
            rev: node.rev_id.clone(),
            deleted: node.deleted,
            revisions: Revisions::from_path(&path),
            attachments: BTreeMap::new(),
            body: node.body.clone(),
        };

        let mut follows = Vec::new();
        for attachment in self.source.attachments(node.sequence)? {
            let mut wire = WireAttachment {
                content_type: attachment.content_type.clone(),
                revpos: attachment.revpos,
                digest: Some(attachment.digest()),
                length: Some(attachment.length),
                encoding: (attachment.encoding == Encoding::Gzip).then(|| "gzip".to_string()),
                ..Default::default()
            };
            if attachment.revpos <= min_revpos {
                wire.stub = true;
            } else {
                let data = self.source.attachment_data(&node.doc_id, &attachment)?;
                if self
                    .settings
                    .attachment_inline
                    .should_inline(attachment.length, self.settings.small_attachment_threshold)
                {
                    wire.data = Some(WireAttachment::encode_data(&data));
                } else {
                    wire.follows = true;
                    follows.push((attachment.name.clone(), attachment.content_type.clone(), data));
                }
            }
            doc.attachments.insert(attachment.name.clone(), wire);
        }

        let json = doc.to_json();
        if follows.is_empty() {
            return Ok(Outgoing::Bulk(json));
        }

        // Parts follow the key order of `_attachments`.
        follows.sort_by(|a, b| a.0.cmp(&b.0));
        let mut writer = MultipartWriter::new(&json)?;
        for (name, content_type, data) in &follows {
            writer.add_attachment(name, content_type, data);
        }
        Ok(Outgoing::Multipart(node.doc_id.clone(), writer.finish()))
    }

    fn emit(&self, event: ReplicationEvent) {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(events) = progress {
            events.emit(&event);
        }
    }
}

impl ReplicationStrategy for PushStrategy {
    fn replication_id(&self) -> &str {
        &self.replication_id
    }

    fn run(&self) -> Result<ReplicationSummary> {
        if !self.target.exists()? {
            return Err(SyncError::DatabaseNotFound(self.target.identifier()));
        }

        let mut summary = ReplicationSummary {
            checkpoint: self.target.get_checkpoint(&self.replication_id)?,
            ..Default::default()
        };
        let limit = self.settings.change_limit_per_batch;

        for batch in 1..=self.settings.batch_limit_per_run {
            if self.is_cancelled() {
                break;
            }
            let since = self.read_checkpoint()?;
            let changes = self.source.changes(since, limit)?;
            if changes.results.is_empty() {
                log::debug!("[PushStrategy] no local changes since {}", since);
                break;
            }

            let selected: Vec<Change> = match &self.filter {
                Some(filter) => changes
                    .results
                    .iter()
                    .filter(|c| filter.should_replicate(&c.revision))
                    .cloned()
                    .collect(),
                None => changes.results.clone(),
            };
            if selected.len() < changes.results.len() {
                log::debug!(
                    "[PushStrategy] filter kept {} of {} changes",
                    selected.len(),
                    changes.results.len()
                );
            }

            let revisions = self.push_batch(&selected)?;
            if self.is_cancelled() {
                log::info!("[PushStrategy] batch {} cancelled, checkpoint kept at {}", batch, since);
                break;
            }

            let checkpoint = changes.last_sequence.to_string();
            self.target.put_checkpoint(&self.replication_id, &checkpoint)?;
            log::debug!(
                "[PushStrategy] batch {}: {} changes, {} revisions, checkpoint {}",
                batch,
                selected.len(),
                revisions,
                checkpoint
            );

            summary.batches += 1;
            summary.documents += selected.len();
            summary.revisions += revisions;
            summary.checkpoint = Some(checkpoint.clone());
            self.emit(ReplicationEvent::BatchCompleted {
                replication_id: self.replication_id.clone(),
                batch,
                documents: selected.len(),
                checkpoint,
            });

            if changes.results.len() < limit {
                break;
            }
        }

        Ok(summary)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_progress(&self, events: Arc<EventRegistry<ReplicationEvent>>) {
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
    }
}

impl std::fmt::Debug for PushStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushStrategy")
            .field("replication_id", &self.replication_id)
            .field("source", &self.source.name())
            .field("target", &self.target.identifier())
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
