//! Pull and push replication with CouchDB-compatible databases.
//!
//! A replication run is driven by a [`ReplicationStrategy`] (either
//! [`PullStrategy`] or [`PushStrategy`]) and wrapped by a [`Replicator`]
//! that tracks its state and reports [`ReplicationEvent`]s.
//!
//! Cancellation is cooperative: the flag is checked at batch boundaries and
//! before each commit. Work already committed stays committed, and the
//! current unit of work finishes before the run stops.
//!
//! # Example
//!
//! ```ignore
//! use couchsync_core::replication::{CouchClient, PullStrategy, Replicator};
//! use std::sync::Arc;
//!
//! let remote = Arc::new(CouchClient::new("http://localhost:5984/notes")?);
//! let pull = PullStrategy::new(remote, datastore.clone(), Default::default());
//! let replicator = Replicator::new(Arc::new(pull));
//! replicator.start()?;
//! let summary = replicator.join()?;
//! ```

#[cfg(feature = "http")]
mod couch_client;
mod datastore_remote;
pub mod multipart;
mod pull;
mod push;
pub mod remote;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

#[cfg(feature = "http")]
pub use couch_client::CouchClient;
pub use datastore_remote::DatastoreRemote;
pub use pull::PullStrategy;
pub use push::{PushFilter, PushStrategy};
pub use remote::RemoteDatabase;

use crate::config::PullFilter;
use crate::error::{Result, SyncError};
use crate::events::{EventCallback, EventRegistry, ReplicationEvent, SubscriptionId};

/// Derive the stable id of a replication between `source` and `target`.
///
/// The id is the hex SHA-256 of the canonical JSON
/// `{"filter": {...}, "source": ..., "target": ...}`, so the same logical
/// replication finds its checkpoint again after a restart.
pub fn replication_id(source: &str, target: &str, filter: Option<&PullFilter>) -> String {
    let filter = filter.map(|f| json!({ "name": f.name, "params": f.params }));
    hash_identity(source, target, filter)
}

pub(crate) fn hash_identity(source: &str, target: &str, filter: Option<Value>) -> String {
    let mut identity = json!({ "source": source, "target": target });
    if let Some(filter) = filter {
        identity["filter"] = filter;
    }
    hex::encode(Sha256::digest(identity.to_string().as_bytes()))
}

/// Lifecycle of a replication run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// Not yet started.
    #[default]
    NotStarted,
    /// Batches in flight.
    Running,
    /// Caught up with the source.
    Completed,
    /// Stopped by an error.
    Errored,
    /// Stopped by [`Replicator::cancel`].
    Cancelled,
}

impl ReplicationState {
    /// Whether the run is over.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReplicationState::Completed | ReplicationState::Errored | ReplicationState::Cancelled
        )
    }
}

/// Totals of one replication run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSummary {
    /// Batches whose checkpoint was stored
    pub batches: usize,
    /// Documents examined across those batches
    pub documents: usize,
    /// Revisions written to the target
    pub revisions: usize,
    /// Checkpoint at the end of the run
    pub checkpoint: Option<String>,
    /// When the run started, set by [`Replicator`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished, set by [`Replicator`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One direction of replication.
pub trait ReplicationStrategy: Send + Sync {
    /// Stable identity of this replication
    fn replication_id(&self) -> &str;

    /// Run batches until no changes remain, the batch ceiling is reached or
    /// the run is cancelled.
    fn run(&self) -> Result<ReplicationSummary>;

    /// Request cooperative cancellation
    fn cancel(&self);

    /// Whether cancellation was requested
    fn is_cancelled(&self) -> bool;

    /// Observe per-batch progress
    fn set_progress(&self, events: Arc<EventRegistry<ReplicationEvent>>);
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the flag is set.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run `job` over `inputs` on at most `workers` threads.
///
/// Workers stop taking new inputs once `cancel` is set; inputs never started
/// produce no output. Results come back in input order. The first error, in
/// input order, is returned.
pub(crate) fn run_pool<I, O, F>(
    inputs: Vec<I>,
    workers: usize,
    cancel: &CancelFlag,
    job: F,
) -> Result<Vec<O>>
where
    I: Send,
    O: Send,
    F: Fn(I) -> Result<O> + Sync,
{
    let queue = Mutex::new(inputs.into_iter().enumerate().collect::<VecDeque<_>>());
    let results = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    let Some((index, input)) = next else {
                        break;
                    };
                    let output = job(input);
                    results
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((index, output));
                }
            });
        }
    });

    let mut results = results.into_inner().unwrap_or_else(|e| e.into_inner());
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, output)| output).collect()
}

/// Runs a strategy and reports its lifecycle.
pub struct Replicator {
    strategy: Arc<dyn ReplicationStrategy>,
    state: Arc<Mutex<ReplicationState>>,
    events: Arc<EventRegistry<ReplicationEvent>>,
    handle: Mutex<Option<JoinHandle<Result<ReplicationSummary>>>>,
}

impl Replicator {
    /// Wrap a strategy.
    pub fn new(strategy: Arc<dyn ReplicationStrategy>) -> Self {
        let events = Arc::new(EventRegistry::new());
        strategy.set_progress(Arc::clone(&events));
        Self {
            strategy,
            state: Arc::new(Mutex::new(ReplicationState::NotStarted)),
            events,
            handle: Mutex::new(None),
        }
    }

    /// Subscribe to replication events.
    pub fn subscribe(&self, callback: EventCallback<ReplicationEvent>) -> SubscriptionId {
        self.events.subscribe(callback)
    }

    /// Current state.
    pub fn state(&self) -> ReplicationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Identity of the wrapped replication.
    pub fn replication_id(&self) -> &str {
        self.strategy.replication_id()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        log::info!("[Replicator] cancelling {}", self.strategy.replication_id());
        self.strategy.cancel();
    }

    /// Start the run on a background thread.
    ///
    /// Fails if the replicator has already been started.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ReplicationState::NotStarted {
                return Err(SyncError::InvalidArgument(format!(
                    "replication {} already started",
                    self.strategy.replication_id()
                )));
            }
            *state = ReplicationState::Running;
        }

        let strategy = Arc::clone(&self.strategy);
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.events);
        let handle = std::thread::Builder::new()
            .name("couchsync-replicator".into())
            .spawn(move || execute(strategy.as_ref(), &state, &events))?;
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Run to completion on the calling thread.
    pub fn run(&self) -> Result<ReplicationSummary> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ReplicationState::NotStarted {
                return Err(SyncError::InvalidArgument(format!(
                    "replication {} already started",
                    self.strategy.replication_id()
                )));
            }
            *state = ReplicationState::Running;
        }
        execute(self.strategy.as_ref(), &self.state, &self.events)
    }

    /// Wait for a run started with [`Replicator::start`].
    pub fn join(&self) -> Result<ReplicationSummary> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| SyncError::InvalidArgument("replicator was not started".into()))?;
        handle
            .join()
            .map_err(|_| SyncError::Storage("replication thread panicked".into()))?
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("replication_id", &self.strategy.replication_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn execute(
    strategy: &dyn ReplicationStrategy,
    state: &Mutex<ReplicationState>,
    events: &EventRegistry<ReplicationEvent>,
) -> Result<ReplicationSummary> {
    let replication_id = strategy.replication_id().to_string();
    log::info!("[Replicator] starting {}", replication_id);
    events.emit(&ReplicationEvent::Started {
        replication_id: replication_id.clone(),
    });

    let started_at = Utc::now();
    let mut result = strategy.run();
    if let Ok(summary) = &mut result {
        summary.started_at = Some(started_at);
        summary.finished_at = Some(Utc::now());
    }
    let (final_state, event) = match &result {
        Ok(_) | Err(SyncError::Cancelled) if strategy.is_cancelled() => (
            ReplicationState::Cancelled,
            ReplicationEvent::Cancelled {
                replication_id: replication_id.clone(),
            },
        ),
        Ok(summary) => (
            ReplicationState::Completed,
            ReplicationEvent::Completed {
                replication_id: replication_id.clone(),
                batches: summary.batches,
                documents: summary.documents,
            },
        ),
        Err(e) => {
            log::error!("[Replicator] {} failed: {}", replication_id, e);
            (
                ReplicationState::Errored,
                ReplicationEvent::Errored {
                    replication_id: replication_id.clone(),
                    error: e.to_serializable(),
                },
            )
        }
    };

    *state.lock().unwrap_or_else(|e| e.into_inner()) = final_state;
    log::info!("[Replicator] {} finished: {:?}", replication_id, final_state);
    events.emit(&event);
    result
}
