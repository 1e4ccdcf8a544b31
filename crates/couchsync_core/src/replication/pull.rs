//! Remote-to-local replication.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::remote::{ChangesFeed, DocumentRevs, RemoteDatabase, WireAttachment, sequence_to_string};
use super::{CancelFlag, ReplicationStrategy, ReplicationSummary, replication_id, run_pool};
use crate::config::PullSettings;
use crate::datastore::{Datastore, ForceInsertItem, POSSIBLE_ANCESTORS_LIMIT};
use crate::error::{Result, SyncError};
use crate::events::{EventRegistry, ReplicationEvent};
use crate::revision::{Encoding, IncomingAttachment, RevisionId};

/// Pulls changes from a remote database into a local [`Datastore`].
///
/// Each batch reads one page of the remote changes feed, diffs it against
/// the local trees, fetches the missing histories on a worker pool and merges
/// them with [`Datastore::force_insert`]. The checkpoint advances only after
/// every chunk of the batch has been committed.
pub struct PullStrategy {
    source: Arc<dyn RemoteDatabase>,
    target: Arc<Datastore>,
    settings: PullSettings,
    replication_id: String,
    cancel: CancelFlag,
    progress: Mutex<Option<Arc<EventRegistry<ReplicationEvent>>>>,
}

impl PullStrategy {
    /// Create a pull from `source` into `target`.
    pub fn new(source: Arc<dyn RemoteDatabase>, target: Arc<Datastore>, settings: PullSettings) -> Self {
        let replication_id = replication_id(
            &source.identifier(),
            &format!("local:{}", target.name()),
            settings.filter.as_ref(),
        );
        Self {
            source,
            target,
            settings,
            replication_id,
            cancel: CancelFlag::new(),
            progress: Mutex::new(None),
        }
    }

    /// Process one page of changes. Returns the number of revisions inserted.
    fn pull_batch(&self, feed: &ChangesFeed) -> Result<usize> {
        let mut wanted: BTreeMap<String, BTreeSet<RevisionId>> = BTreeMap::new();
        for entry in &feed.results {
            wanted
                .entry(entry.id.clone())
                .or_default()
                .extend(entry.changes.iter().map(|c| c.rev.clone()));
        }

        let missing: Vec<(String, Vec<RevisionId>)> = self
            .target
            .revs_diff(&wanted)?
            .into_iter()
            .map(|(doc_id, revs)| (doc_id, revs.into_iter().collect()))
            .collect();
        log::debug!(
            "[PullStrategy] {} of {} documents have missing revisions",
            missing.len(),
            wanted.len()
        );

        let mut inserted = 0;
        for chunk in missing.chunks(self.settings.insert_batch_size.max(1)) {
            if self.is_cancelled() {
                break;
            }
            let fetched = run_pool(
                chunk.to_vec(),
                self.settings.worker_threads,
                &self.cancel,
                |(doc_id, revs)| self.fetch_document(&doc_id, &revs),
            )?;
            if self.is_cancelled() {
                log::info!("[PullStrategy] cancelled before commit, dropping fetched chunk");
                break;
            }
            let items: Vec<ForceInsertItem> = fetched.into_iter().flatten().collect();
            inserted += self.target.force_insert(&items)?;
        }
        Ok(inserted)
    }

    /// Fetch the missing revisions of one document and prepare them for
    /// insertion.
    fn fetch_document(&self, doc_id: &str, revs: &[RevisionId]) -> Result<Vec<ForceInsertItem>> {
        let mut atts_since = BTreeSet::new();
        for rev in revs {
            atts_since.extend(self.target.possible_ancestors(doc_id, rev, POSSIBLE_ANCESTORS_LIMIT)?);
        }
        let atts_since: Vec<RevisionId> = atts_since
            .into_iter()
            .rev()
            .take(POSSIBLE_ANCESTORS_LIMIT)
            .collect();

        let docs = self.source.open_revisions(
            doc_id,
            revs,
            &atts_since,
            self.settings.pull_attachments_inline,
        )?;
        log::trace!("[PullStrategy] fetched {} revisions of {}", docs.len(), doc_id);

        docs.into_iter()
            .map(|doc| {
                self.prepare(doc).inspect_err(|e| {
                    if matches!(e, SyncError::Attachment { .. }) {
                        self.cancel.cancel();
                    }
                })
            })
            .collect()
    }

    fn prepare(&self, doc: DocumentRevs) -> Result<ForceInsertItem> {
        let history = doc.history()?;
        let mut attachments = Vec::with_capacity(doc.attachments.len());
        for (name, wire) in &doc.attachments {
            attachments.push(self.prepare_attachment(&doc, &history, name, wire)?);
        }
        Ok(ForceInsertItem::new(doc.id, history, doc.body, doc.deleted).with_attachments(attachments))
    }

    /// Decode inline content, copy forward from a local ancestor, or download.
    fn prepare_attachment(
        &self,
        doc: &DocumentRevs,
        history: &[RevisionId],
        name: &str,
        wire: &WireAttachment,
    ) -> Result<IncomingAttachment> {
        if let Some(decoded) = wire.decode_data() {
            let data = decoded
                .map_err(|e| SyncError::attachment(&doc.id, name, format!("invalid base64: {e}")))?;
            return Ok(IncomingAttachment::Data {
                name: name.to_string(),
                content_type: wire.content_type.clone(),
                revpos: wire.revpos,
                encoding: Encoding::from_wire(wire.encoding.as_deref()),
                length: wire.length.unwrap_or(data.len() as u64),
                data,
            });
        }

        if self
            .target
            .has_attachment_in_history(&doc.id, history, name, wire.revpos)?
        {
            return Ok(IncomingAttachment::Stub {
                name: name.to_string(),
                revpos: wire.revpos,
            });
        }

        let data = self
            .source
            .get_attachment(&doc.id, &doc.rev, name)
            .map_err(|e| SyncError::attachment(&doc.id, name, format!("download failed: {e}")))?;
        Ok(IncomingAttachment::Data {
            name: name.to_string(),
            content_type: wire.content_type.clone(),
            revpos: wire.revpos,
            encoding: Encoding::Plain,
            length: data.len() as u64,
            data,
        })
    }

    fn emit(&self, event: ReplicationEvent) {
        let progress = self.progress.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(events) = progress {
            events.emit(&event);
        }
    }
}

impl ReplicationStrategy for PullStrategy {
    fn replication_id(&self) -> &str {
        &self.replication_id
    }

    fn run(&self) -> Result<ReplicationSummary> {
        if !self.source.exists()? {
            return Err(SyncError::DatabaseNotFound(self.source.identifier()));
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
            let since = self.target.get_checkpoint(&self.replication_id)?;
            let feed = self
                .source
                .changes(since.as_deref(), limit, self.settings.filter.as_ref())?;
            if feed.results.is_empty() {
                log::debug!("[PullStrategy] no changes since {:?}", since);
                break;
            }

            let revisions = self.pull_batch(&feed)?;
            if self.is_cancelled() {
                log::info!("[PullStrategy] batch {} cancelled, checkpoint kept at {:?}", batch, since);
                break;
            }

            let checkpoint = sequence_to_string(&feed.last_seq);
            self.target.put_checkpoint(&self.replication_id, &checkpoint)?;
            log::debug!(
                "[PullStrategy] batch {}: {} changes, {} revisions, checkpoint {}",
                batch,
                feed.results.len(),
                revisions,
                checkpoint
            );

            summary.batches += 1;
            summary.documents += feed.results.len();
            summary.revisions += revisions;
            summary.checkpoint = Some(checkpoint.clone());
            self.emit(ReplicationEvent::BatchCompleted {
                replication_id: self.replication_id.clone(),
                batch,
                documents: feed.results.len(),
                checkpoint,
            });

            if feed.results.len() < limit {
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

impl std::fmt::Debug for PullStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullStrategy")
            .field("replication_id", &self.replication_id)
            .field("source", &self.source.identifier())
            .field("target", &self.target.name())
            .finish_non_exhaustive()
    }
}
