//! Integration tests for pull and push replication between datastores

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use couchsync_core::config::{AttachmentInline, PullFilter, PullSettings, PushSettings};
use couchsync_core::events::ReplicationEvent;
use couchsync_core::replication::multipart::MultipartBody;
use couchsync_core::replication::remote::{ChangesFeed, DocumentRevs, RevsDiffEntry};
use couchsync_core::replication::{
    DatastoreRemote, PullStrategy, PushFilter, PushStrategy, RemoteDatabase, ReplicationState,
    ReplicationStrategy, Replicator,
};
use couchsync_core::revision::{DocumentBody, RevisionId, UnsavedAttachment};
use couchsync_core::{Datastore, Result, SyncError};
use serde_json::{Value, json};

fn body(value: Value) -> DocumentBody {
    DocumentBody::from_value(value).unwrap()
}

fn memory() -> Arc<Datastore> {
    Arc::new(Datastore::in_memory())
}

#[derive(Default)]
struct MockState {
    missing: bool,
    failing_downloads: usize,
    failing_bulk_docs: usize,
    failing_multipart: usize,
    downloads: usize,
    bulk_docs: Vec<Value>,
    multipart: Vec<(String, MultipartBody)>,
}

/// A datastore-backed remote that records uploads and can inject failures.
struct MockRemote {
    inner: DatastoreRemote,
    state: Arc<Mutex<MockState>>,
}

impl MockRemote {
    fn new(datastore: Arc<Datastore>) -> (Arc<Self>, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let remote = Arc::new(Self {
            inner: DatastoreRemote::new(datastore),
            state: Arc::clone(&state),
        });
        (remote, state)
    }
}

impl RemoteDatabase for MockRemote {
    fn identifier(&self) -> String {
        format!("mock:{}", self.inner.identifier())
    }

    fn exists(&self) -> Result<bool> {
        Ok(!self.state.lock().unwrap().missing)
    }

    fn create(&self) -> Result<()> {
        self.state.lock().unwrap().missing = false;
        Ok(())
    }

    fn changes(
        &self,
        since: Option<&str>,
        limit: usize,
        filter: Option<&PullFilter>,
    ) -> Result<ChangesFeed> {
        self.inner.changes(since, limit, filter)
    }

    fn revs_diff(
        &self,
        revisions: &BTreeMap<String, BTreeSet<RevisionId>>,
    ) -> Result<BTreeMap<String, RevsDiffEntry>> {
        self.inner.revs_diff(revisions)
    }

    fn open_revisions(
        &self,
        doc_id: &str,
        revs: &[RevisionId],
        atts_since: &[RevisionId],
        attachments: bool,
    ) -> Result<Vec<DocumentRevs>> {
        self.inner.open_revisions(doc_id, revs, atts_since, attachments)
    }

    fn get_attachment(&self, doc_id: &str, rev: &RevisionId, name: &str) -> Result<Vec<u8>> {
        {
            let mut state = self.state.lock().unwrap();
            state.downloads += 1;
            if state.failing_downloads > 0 {
                state.failing_downloads -= 1;
                return Err(unavailable());
            }
        }
        self.inner.get_attachment(doc_id, rev, name)
    }

    fn bulk_docs(&self, docs: &[Value]) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.failing_bulk_docs > 0 {
                state.failing_bulk_docs -= 1;
                return Err(unavailable());
            }
            state.bulk_docs.extend(docs.iter().cloned());
        }
        self.inner.bulk_docs(docs)
    }

    fn put_multipart(&self, doc_id: &str, body: &MultipartBody) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.failing_multipart > 0 {
                state.failing_multipart -= 1;
                return Err(unavailable());
            }
            state.multipart.push((doc_id.to_string(), body.clone()));
        }
        self.inner.put_multipart(doc_id, body)
    }

    fn get_checkpoint(&self, replication_id: &str) -> Result<Option<String>> {
        self.inner.get_checkpoint(replication_id)
    }

    fn put_checkpoint(&self, replication_id: &str, sequence: &str) -> Result<()> {
        self.inner.put_checkpoint(replication_id, sequence)
    }
}

fn unavailable() -> SyncError {
    SyncError::Http {
        status: 503,
        message: "unavailable".into(),
    }
}

fn pull(source: Arc<dyn RemoteDatabase>, target: &Arc<Datastore>, settings: PullSettings) -> PullStrategy {
    PullStrategy::new(source, Arc::clone(target), settings)
}

fn push(source: &Arc<Datastore>, target: Arc<dyn RemoteDatabase>, settings: PushSettings) -> PushStrategy {
    PushStrategy::new(Arc::clone(source), target, settings)
}

fn local(ds: &Arc<Datastore>) -> Arc<dyn RemoteDatabase> {
    Arc::new(DatastoreRemote::new(Arc::clone(ds)))
}

#[test]
fn test_pull_copies_documents_into_sqlite() {
    let source = memory();
    let first = source
        .create_document(
            Some("note"),
            body(json!({"title": "draft"})),
            vec![UnsavedAttachment::new("a.txt", "text/plain", b"hello".to_vec())],
        )
        .unwrap();
    source
        .update_document("note", &first.rev_id, body(json!({"title": "final"})), vec![])
        .unwrap();
    source
        .create_document(Some("other"), body(json!({"n": 1})), vec![])
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let target = Arc::new(Datastore::open(dir.path().join("target.db")).unwrap());
    let strategy = pull(local(&source), &target, PullSettings::default());

    let summary = strategy.run().unwrap();
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.documents, 2);
    assert_eq!(summary.revisions, 2);

    let note = target.get_document("note", None).unwrap();
    assert_eq!(note.body["title"], json!("final"));
    assert_eq!(
        note.rev_id,
        source.get_document("note", None).unwrap().rev_id
    );
    let attachments = target.attachments(note.sequence).unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(
        target.attachment_data("note", &attachments[0]).unwrap(),
        b"hello".to_vec()
    );

    // The ancestor arrived as a stub.
    let tree = target.get_all_revisions("note").unwrap();
    assert_eq!(tree.len(), 2);
    assert!(tree.lookup(&first.rev_id).unwrap().is_stub());

    let checkpoint = target.get_checkpoint(strategy.replication_id()).unwrap();
    assert_eq!(checkpoint, Some(source.last_sequence().unwrap().to_string()));

    // Nothing new: no batch, no writes.
    let before = target.last_sequence().unwrap();
    let again = pull(local(&source), &target, PullSettings::default())
        .run()
        .unwrap();
    assert_eq!(again.batches, 0);
    assert_eq!(target.last_sequence().unwrap(), before);
}

#[test]
fn test_pull_propagates_deletions() {
    let source = memory();
    let doc = source
        .create_document(Some("gone"), body(json!({"x": 1})), vec![])
        .unwrap();
    source.delete_document("gone", &doc.rev_id).unwrap();

    let target = memory();
    pull(local(&source), &target, PullSettings::default())
        .run()
        .unwrap();

    assert!(matches!(
        target.get_document("gone", None),
        Err(SyncError::DocumentNotFound(_))
    ));
    let tree = target.get_all_revisions("gone").unwrap();
    assert_eq!(tree.len(), 2);
    assert!(tree.current_revision().unwrap().deleted);
}

#[test]
fn test_push_and_pull_converge_on_conflicts() {
    let a = memory();
    let b = memory();

    let base = a
        .create_document(Some("doc"), body(json!({"who": "base"})), vec![])
        .unwrap();
    push(&a, local(&b), PushSettings::default()).run().unwrap();
    assert_eq!(b.get_document("doc", None).unwrap().rev_id, base.rev_id);

    a.update_document("doc", &base.rev_id, body(json!({"who": "a"})), vec![])
        .unwrap();
    b.update_document("doc", &base.rev_id, body(json!({"who": "b"})), vec![])
        .unwrap();

    push(&a, local(&b), PushSettings::default()).run().unwrap();
    pull(local(&b), &a, PullSettings::default()).run().unwrap();

    let tree_a = a.get_all_revisions("doc").unwrap();
    let tree_b = b.get_all_revisions("doc").unwrap();
    assert_eq!(tree_a.leaf_revision_ids(), tree_b.leaf_revision_ids());
    assert_eq!(tree_a.leaf_revision_ids().len(), 2);
    assert_eq!(
        tree_a.current_revision().unwrap().rev_id,
        tree_b.current_revision().unwrap().rev_id
    );
    assert!(tree_a.has_conflicts());
    assert_eq!(a.conflicted_document_ids().unwrap(), vec!["doc".to_string()]);
    assert_eq!(b.conflicted_document_ids().unwrap(), vec!["doc".to_string()]);
}

#[test]
fn test_pull_resumes_from_checkpoint_after_interrupted_batch() {
    let source = memory();
    for i in 0..50 {
        let attachments = if i == 25 {
            vec![UnsavedAttachment::new("scan.png", "image/png", vec![7u8; 256])]
        } else {
            Vec::new()
        };
        source
            .create_document(Some(&format!("doc-{i:03}")), body(json!({"i": i})), attachments)
            .unwrap();
    }
    let (remote, state) = MockRemote::new(Arc::clone(&source));
    state.lock().unwrap().failing_downloads = 1;

    let settings = PullSettings {
        change_limit_per_batch: 100,
        insert_batch_size: 20,
        ..Default::default()
    };
    let target = memory();

    let interrupted = pull(remote.clone(), &target, settings.clone());
    let err = interrupted.run().unwrap_err();
    assert!(matches!(err, SyncError::Attachment { .. }));
    assert!(interrupted.is_cancelled());
    assert_eq!(target.get_checkpoint(interrupted.replication_id()).unwrap(), None);
    // Only the chunk committed before the failure is visible.
    assert_eq!(target.document_ids().unwrap().len(), 20);
    assert!(target.get_all_revisions("doc-025").is_err());

    let resumed = pull(remote, &target, settings);
    assert_eq!(resumed.replication_id(), interrupted.replication_id());
    let summary = resumed.run().unwrap();
    assert_eq!(summary.documents, 50);
    assert_eq!(summary.revisions, 30);

    let ids = target.document_ids().unwrap();
    assert_eq!(ids.len(), 50);
    for id in &ids {
        assert_eq!(target.get_all_revisions(id).unwrap().len(), 1, "{id} duplicated");
    }
    let doc = target.get_document("doc-025", None).unwrap();
    let attachments = target.attachments(doc.sequence).unwrap();
    assert_eq!(
        target.attachment_data("doc-025", &attachments[0]).unwrap(),
        vec![7u8; 256]
    );
    assert_eq!(state.lock().unwrap().downloads, 2);
    assert_eq!(
        target.get_checkpoint(resumed.replication_id()).unwrap(),
        Some(source.last_sequence().unwrap().to_string())
    );
}

#[test]
fn test_pull_respects_batch_limits() {
    let source = memory();
    for i in 0..7 {
        source
            .create_document(Some(&format!("d{i}")), body(json!({"i": i})), vec![])
            .unwrap();
    }
    let target = memory();
    let settings = PullSettings {
        change_limit_per_batch: 3,
        batch_limit_per_run: 2,
        ..Default::default()
    };

    let summary = pull(local(&source), &target, settings.clone()).run().unwrap();
    assert_eq!(summary.batches, 2);
    assert_eq!(target.document_ids().unwrap().len(), 6);

    let rest = pull(local(&source), &target, settings).run().unwrap();
    assert_eq!(rest.batches, 1);
    assert_eq!(rest.documents, 1);
    assert_eq!(target.document_ids().unwrap().len(), 7);
}

#[test]
fn test_push_inlines_small_attachments_and_streams_large_ones() {
    let source = memory();
    source
        .create_document(
            Some("small-doc"),
            body(json!({"kind": "small"})),
            vec![UnsavedAttachment::new("small.txt", "text/plain", b"tiny".to_vec())],
        )
        .unwrap();
    let big = vec![42u8; 200];
    source
        .create_document(
            Some("big-doc"),
            body(json!({"kind": "big"})),
            vec![UnsavedAttachment::new("big.bin", "application/octet-stream", big.clone())],
        )
        .unwrap();

    let target = memory();
    let (remote, state) = MockRemote::new(Arc::clone(&target));
    let settings = PushSettings {
        attachment_inline: AttachmentInline::Small,
        small_attachment_threshold: 64,
        ..Default::default()
    };
    push(&source, remote, settings).run().unwrap();

    let state = state.lock().unwrap();
    assert_eq!(state.bulk_docs.len(), 1);
    let small = &state.bulk_docs[0];
    assert_eq!(small["_id"], json!("small-doc"));
    assert_eq!(
        small["_attachments"]["small.txt"]["data"],
        json!(base64_of(b"tiny"))
    );

    assert_eq!(state.multipart.len(), 1);
    let (doc_id, multipart) = &state.multipart[0];
    assert_eq!(doc_id, "big-doc");
    let (json_part, parts) = multipart.parse().unwrap();
    let wire = &json_part["_attachments"]["big.bin"];
    assert_eq!(wire["follows"], json!(true));
    assert!(wire.get("data").is_none());
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].name.as_deref(), Some("big.bin"));
    assert_eq!(parts[0].data, big);

    // Both landed on the target intact.
    let doc = target.get_document("big-doc", None).unwrap();
    let attachments = target.attachments(doc.sequence).unwrap();
    assert_eq!(target.attachment_data("big-doc", &attachments[0]).unwrap(), big);
    assert!(target.get_document("small-doc", None).is_ok());
}

fn base64_of(data: &[u8]) -> String {
    couchsync_core::replication::remote::WireAttachment::encode_data(data)
}

#[test]
fn test_push_stubs_attachments_the_remote_already_has() {
    let source = memory();
    let first = source
        .create_document(
            Some("doc"),
            body(json!({"v": 1})),
            vec![UnsavedAttachment::new("a.txt", "text/plain", b"hello".to_vec())],
        )
        .unwrap();
    let target = memory();
    let (remote, state) = MockRemote::new(Arc::clone(&target));

    push(&source, remote.clone(), PushSettings::default()).run().unwrap();
    source
        .update_document("doc", &first.rev_id, body(json!({"v": 2})), vec![])
        .unwrap();
    let summary = push(&source, remote, PushSettings::default()).run().unwrap();
    assert_eq!(summary.revisions, 1);

    let state = state.lock().unwrap();
    let second = state.bulk_docs.last().unwrap();
    assert_eq!(second["_revisions"]["start"], json!(2));
    assert_eq!(second["_attachments"]["a.txt"]["stub"], json!(true));
    assert!(second["_attachments"]["a.txt"].get("data").is_none());

    let doc = target.get_document("doc", None).unwrap();
    assert_eq!(doc.body["v"], json!(2));
    let attachments = target.attachments(doc.sequence).unwrap();
    assert_eq!(
        target.attachment_data("doc", &attachments[0]).unwrap(),
        b"hello".to_vec()
    );
}

#[test]
fn test_missing_remote_database_is_fatal() {
    let ds = memory();
    ds.create_document(Some("doc"), body(json!({})), vec![]).unwrap();
    let (remote, state) = MockRemote::new(memory());
    state.lock().unwrap().missing = true;

    assert!(matches!(
        pull(remote.clone(), &ds, PullSettings::default()).run(),
        Err(SyncError::DatabaseNotFound(_))
    ));
    assert!(matches!(
        push(&ds, remote.clone(), PushSettings::default()).run(),
        Err(SyncError::DatabaseNotFound(_))
    ));

    remote.create().unwrap();
    assert!(push(&ds, remote, PushSettings::default()).run().is_ok());
}

#[test]
fn test_replicator_reports_errored_run() {
    let source = memory();
    source
        .create_document(
            Some("doc"),
            body(json!({})),
            vec![UnsavedAttachment::new("a", "text/plain", b"x".to_vec())],
        )
        .unwrap();
    let (remote, state) = MockRemote::new(source);
    state.lock().unwrap().failing_downloads = 1;

    let replicator = Replicator::new(Arc::new(pull(remote, &memory(), PullSettings::default())));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    replicator.subscribe(Arc::new(move |event: &ReplicationEvent| {
        sink.lock().unwrap().push(event.clone());
    }));

    replicator.start().unwrap();
    assert!(replicator.join().is_err());
    assert_eq!(replicator.state(), ReplicationState::Errored);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(matches!(seen[0], ReplicationEvent::Started { .. }));
    match &seen[1] {
        ReplicationEvent::Errored { error, .. } => assert_eq!(error.kind, "Attachment"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn test_replicator_reports_batches_then_completion() {
    let source = memory();
    for i in 0..5 {
        source
            .create_document(Some(&format!("d{i}")), body(json!({"i": i})), vec![])
            .unwrap();
    }
    let settings = PullSettings {
        change_limit_per_batch: 2,
        ..Default::default()
    };
    let replicator = Replicator::new(Arc::new(pull(local(&source), &memory(), settings)));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    replicator.subscribe(Arc::new(move |event: &ReplicationEvent| {
        sink.lock().unwrap().push(event.clone());
    }));

    let summary = replicator.run().unwrap();
    assert_eq!(summary.batches, 3);
    assert!(summary.finished_at.is_some());
    assert_eq!(replicator.state(), ReplicationState::Completed);

    let seen = seen.lock().unwrap();
    let batches: Vec<usize> = seen
        .iter()
        .filter_map(|e| match e {
            ReplicationEvent::BatchCompleted { batch, .. } => Some(*batch),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![1, 2, 3]);
    assert!(seen.last().unwrap().is_terminal());
}

#[test]
fn test_cancelled_pull_writes_nothing() {
    let source = memory();
    source
        .create_document(Some("doc"), body(json!({})), vec![])
        .unwrap();
    let target = memory();
    let strategy = pull(local(&source), &target, PullSettings::default());
    strategy.cancel();

    let summary = strategy.run().unwrap();
    assert_eq!(summary.batches, 0);
    assert!(target.document_ids().unwrap().is_empty());
    assert_eq!(target.get_checkpoint(strategy.replication_id()).unwrap(), None);
}

#[test]
fn test_push_checkpoint_waits_for_every_upload() {
    let source = memory();
    source
        .create_document(Some("small-doc"), body(json!({"kind": "small"})), vec![])
        .unwrap();
    source
        .create_document(
            Some("big-doc"),
            body(json!({"kind": "big"})),
            vec![UnsavedAttachment::new("big.bin", "application/octet-stream", vec![1u8; 200])],
        )
        .unwrap();
    let target = memory();
    let (remote, state) = MockRemote::new(Arc::clone(&target));
    let settings = PushSettings {
        small_attachment_threshold: 64,
        ..Default::default()
    };

    state.lock().unwrap().failing_multipart = 1;
    let first = push(&source, remote.clone(), settings.clone());
    assert!(matches!(first.run(), Err(SyncError::Http { status: 503, .. })));
    assert_eq!(remote.get_checkpoint(first.replication_id()).unwrap(), None);

    state.lock().unwrap().failing_bulk_docs = 1;
    let second = push(&source, remote.clone(), settings.clone());
    assert!(second.run().is_err());
    assert_eq!(remote.get_checkpoint(second.replication_id()).unwrap(), None);
    assert!(target.get_document("big-doc", None).is_ok());
    assert!(target.get_document("small-doc", None).is_err());

    let last = push(&source, remote.clone(), settings);
    last.run().unwrap();
    assert_eq!(
        remote.get_checkpoint(last.replication_id()).unwrap(),
        Some(source.last_sequence().unwrap().to_string())
    );
    assert!(target.get_document("small-doc", None).is_ok());
}

#[test]
fn test_push_filter_narrows_changes() {
    let source = memory();
    for id in ["keep-1", "skip-1", "keep-2"] {
        source
            .create_document(Some(id), body(json!({"id": id})), vec![])
            .unwrap();
    }
    let target = memory();
    let filter = PushFilter::new("keep-only", |rev| rev.doc_id.starts_with("keep"));

    let unfiltered = push(&source, local(&target), PushSettings::default());
    let filtered = push(&source, local(&target), PushSettings::default()).with_filter(filter);
    assert_ne!(filtered.replication_id(), unfiltered.replication_id());

    let summary = filtered.run().unwrap();
    assert_eq!(summary.documents, 2);
    assert_eq!(summary.revisions, 2);
    assert_eq!(
        target.document_ids().unwrap(),
        vec!["keep-1".to_string(), "keep-2".to_string()]
    );
    assert_eq!(
        target.get_checkpoint(filtered.replication_id()).unwrap(),
        Some(source.last_sequence().unwrap().to_string())
    );
}

#[test]
fn test_push_filter_rejecting_everything_still_advances_checkpoint() {
    let source = memory();
    source
        .create_document(Some("private"), body(json!({})), vec![])
        .unwrap();
    let target = memory();
    let strategy = push(&source, local(&target), PushSettings::default())
        .with_filter(PushFilter::new("nothing", |_| false));

    let summary = strategy.run().unwrap();
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.revisions, 0);
    assert!(target.document_ids().unwrap().is_empty());
    assert_eq!(
        target.get_checkpoint(strategy.replication_id()).unwrap(),
        Some(source.last_sequence().unwrap().to_string())
    );
}
