//! Datastore and replication events, and the registry that delivers them.
//!
//! Datastore events are emitted only after the transaction that produced
//! them has committed. Replication events report state transitions of a
//! single replication run; `Completed`, `Errored` and `Cancelled` are
//! terminal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::SerializableError;

/// Events emitted by a [`Datastore`](crate::Datastore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocumentEvent {
    /// A document received its first revision tree.
    Created {
        /// Document id.
        doc_id: String,
        /// Winning revision after the change.
        rev_id: String,
    },

    /// A document that already existed gained revisions.
    Updated {
        /// Document id.
        doc_id: String,
        /// Winning revision after the change.
        rev_id: String,
    },

    /// A document's winning revision became a tombstone.
    Deleted {
        /// Document id.
        doc_id: String,
        /// The tombstone revision.
        rev_id: String,
    },
}

impl DocumentEvent {
    /// Document id the event refers to.
    pub fn doc_id(&self) -> &str {
        match self {
            DocumentEvent::Created { doc_id, .. }
            | DocumentEvent::Updated { doc_id, .. }
            | DocumentEvent::Deleted { doc_id, .. } => doc_id,
        }
    }
}

/// Events emitted while a replication runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplicationEvent {
    /// A replication run started.
    Started {
        /// Replication identity.
        replication_id: String,
    },

    /// A batch committed and its checkpoint was stored.
    BatchCompleted {
        /// Replication identity.
        replication_id: String,
        /// 1-based batch number within the run.
        batch: usize,
        /// Documents processed in the batch.
        documents: usize,
        /// Checkpoint after the batch.
        checkpoint: String,
    },

    /// The run finished with no more changes to replicate.
    Completed {
        /// Replication identity.
        replication_id: String,
        /// Batches processed.
        batches: usize,
        /// Documents replicated.
        documents: usize,
    },

    /// The run failed.
    Errored {
        /// Replication identity.
        replication_id: String,
        /// Cause of the failure.
        error: SerializableError,
    },

    /// The run stopped because it was cancelled.
    Cancelled {
        /// Replication identity.
        replication_id: String,
    },
}

impl ReplicationEvent {
    /// Whether the event ends a replication run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicationEvent::Completed { .. }
                | ReplicationEvent::Errored { .. }
                | ReplicationEvent::Cancelled { .. }
        )
    }
}

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type for events.
///
/// Callbacks receive a reference to the event and should not block for extended periods.
pub type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Thread-safe registry for managing event subscriptions.
///
/// # Example
///
/// ```ignore
/// use couchsync_core::events::{DocumentEvent, EventRegistry};
/// use std::sync::Arc;
///
/// let registry = EventRegistry::<DocumentEvent>::new();
///
/// let id = registry.subscribe(Arc::new(|event| {
///     println!("Event: {:?}", event);
/// }));
///
/// registry.unsubscribe(id);
/// ```
pub struct EventRegistry<E> {
    callbacks: RwLock<HashMap<SubscriptionId, EventCallback<E>>>,
    next_id: AtomicU64,
}

impl<E> EventRegistry<E> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to events.
    ///
    /// Returns a subscription ID that can be used to unsubscribe later.
    pub fn subscribe(&self, callback: EventCallback<E>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        callbacks.insert(id, callback);
        id
    }

    /// Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        callbacks.remove(&id).is_some()
    }

    /// Emit an event to all registered callbacks.
    ///
    /// Callbacks are invoked synchronously in an undefined order.
    /// If a callback panics, it does not affect other callbacks.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<_> = {
            let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
            callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event))).is_err()
            {
                log::warn!("[EventRegistry] subscriber panicked while handling event");
            }
        }
    }

    /// Get the number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Clear all subscriptions.
    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn created() -> DocumentEvent {
        DocumentEvent::Created {
            doc_id: "doc".into(),
            rev_id: "1-a".into(),
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let registry = EventRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        registry.subscribe(Arc::new(move |_event: &DocumentEvent| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&created());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = EventRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let id = registry.subscribe(Arc::new(move |_event: &DocumentEvent| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&created());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_panic_isolation() {
        let registry = EventRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(|_: &DocumentEvent| {
            panic!("Test panic");
        }));

        let counter_clone = Arc::clone(&counter);
        registry.subscribe(Arc::new(move |_: &DocumentEvent| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&created());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(created()).unwrap();
        assert_eq!(json["type"], "Created");
        assert_eq!(json["doc_id"], "doc");

        let done = ReplicationEvent::Completed {
            replication_id: "r".into(),
            batches: 1,
            documents: 2,
        };
        assert!(done.is_terminal());
        assert!(
            !ReplicationEvent::Started {
                replication_id: "r".into()
            }
            .is_terminal()
        );
    }
}
