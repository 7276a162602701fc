// Entity State Cache
// Authoritative in-memory view of one instance's entities with best-effort persistence

pub mod entity;

pub use entity::{entity_domain, AttributeValue, Attributes, EntityState, STATE_UNAVAILABLE, STATE_UNKNOWN};

use crate::store::Store;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Notification emitted to the detection worker after every cache mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Updated(String),
    Removed(String),
}

impl StateChange {
    pub fn entity_id(&self) -> &str {
        match self {
            StateChange::Updated(id) | StateChange::Removed(id) => id,
        }
    }
}

/// Pending write for the persistence worker
enum PersistOp {
    Upsert {
        state: EntityState,
        previous_value: Option<String>,
    },
    Delete(String),
}

/// Guarded contents of an [`EntityCache`]
struct CacheInner {
    entities: HashMap<String, EntityState>,

    /// Revision of the last `put` per entity; warmed entries have none
    revisions: HashMap<String, u64>,
    revision: u64,

    /// Queue to the persistence writer (absent for memory-only or closed caches)
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
}

/// Per-instance entity cache
///
/// Every mutation happens under one mutex so the prior-value comparison is
/// atomic with the write. Persistence ops are queued under the same lock, so
/// the single writer task applies them in memory order and never feeds back
/// into memory.
pub struct EntityCache {
    /// Owning controller instance
    instance_id: String,

    inner: Mutex<CacheInner>,

    /// Queue to the issue detection worker
    changes_tx: Option<mpsc::Sender<StateChange>>,
}

impl EntityCache {
    /// Memory-only cache, no persistence and no change notifications
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            inner: Mutex::new(CacheInner {
                entities: HashMap::new(),
                revisions: HashMap::new(),
                revision: 0,
                persist_tx: None,
            }),
            changes_tx: None,
        }
    }

    /// Cache backed by the shared store; spawns the persistence writer on
    /// the current runtime and returns its handle so shutdown can drain it
    pub fn with_store(
        instance_id: impl Into<String>,
        store: Store,
        changes_tx: Option<mpsc::Sender<StateChange>>,
    ) -> (Self, JoinHandle<()>) {
        let instance_id = instance_id.into();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_persist_writer(instance_id.clone(), store, persist_rx));

        let cache = Self {
            instance_id,
            inner: Mutex::new(CacheInner {
                entities: HashMap::new(),
                revisions: HashMap::new(),
                revision: 0,
                persist_tx: Some(persist_tx),
            }),
            changes_tx,
        };
        (cache, writer)
    }

    /// Attach the detection channel to a memory-only cache
    pub fn with_changes(mut self, changes_tx: mpsc::Sender<StateChange>) -> Self {
        self.changes_tx = Some(changes_tx);
        self
    }

    /// Stop queueing persistence ops; the writer exits once it drains
    pub fn close(&self) {
        self.inner.lock().persist_tx = None;
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Insert or replace a state, returning the prior value
    pub fn put(&self, state: EntityState) -> Option<EntityState> {
        let entity_id = state.entity_id.clone();
        let previous = {
            let mut inner = self.inner.lock();
            inner.revision += 1;
            let revision = inner.revision;
            inner.revisions.insert(entity_id.clone(), revision);
            let previous = inner.entities.insert(entity_id.clone(), state.clone());
            if let Some(tx) = &inner.persist_tx {
                let op = PersistOp::Upsert {
                    state,
                    previous_value: previous.as_ref().map(|p| p.state.clone()),
                };
                if tx.send(op).is_err() {
                    debug!(instance = %self.instance_id, %entity_id, "persistence writer closed");
                }
            }
            previous
        };

        self.notify(StateChange::Updated(entity_id));
        previous
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.lock().entities.get(entity_id).cloned()
    }

    /// Consistent snapshot of every entity
    pub fn all(&self) -> HashMap<String, EntityState> {
        self.inner.lock().entities.clone()
    }

    pub fn remove(&self, entity_id: &str) -> Option<EntityState> {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.entities.remove(entity_id);
            if removed.is_some() {
                inner.revisions.remove(entity_id);
                self.queue_delete(&inner, entity_id);
            }
            removed
        };

        if removed.is_some() {
            self.notify(StateChange::Removed(entity_id.to_string()));
        }
        removed
    }

    /// Current write revision; every `put` advances it
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Remove entities absent from `live` that were last written at or before `revision`
    ///
    /// Entities written after `revision` arrived while the caller's snapshot
    /// was in flight and are kept. Returns the removed ids.
    pub fn remove_absent(&self, live: &HashSet<String>, revision: u64) -> Vec<String> {
        let removed: Vec<String> = {
            let mut inner = self.inner.lock();
            let stale: Vec<String> = inner
                .entities
                .keys()
                .filter(|id| !live.contains(*id))
                .filter(|id| inner.revisions.get(*id).copied().unwrap_or(0) <= revision)
                .cloned()
                .collect();
            for entity_id in &stale {
                inner.entities.remove(entity_id);
                inner.revisions.remove(entity_id);
                self.queue_delete(&inner, entity_id);
            }
            stale
        };

        for entity_id in &removed {
            self.notify(StateChange::Removed(entity_id.clone()));
        }
        removed
    }

    fn queue_delete(&self, inner: &CacheInner, entity_id: &str) {
        if let Some(tx) = &inner.persist_tx {
            if tx.send(PersistOp::Delete(entity_id.to_string())).is_err() {
                debug!(instance = %self.instance_id, %entity_id, "persistence writer closed");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entities.is_empty()
    }

    /// Seed from persisted rows without emitting changes or rewriting them
    pub fn warm(&self, states: Vec<EntityState>) {
        let mut inner = self.inner.lock();
        for state in states {
            inner.entities.entry(state.entity_id.clone()).or_insert(state);
        }
    }

    fn notify(&self, change: StateChange) {
        if let Some(tx) = &self.changes_tx {
            // The periodic detection sweep covers anything dropped here
            if let Err(e) = tx.try_send(change) {
                debug!(instance = %self.instance_id, error = %e, "state change notification dropped");
            }
        }
    }
}

/// Sequential writer applying cache mutations to the store
async fn run_persist_writer(
    instance_id: String,
    store: Store,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
) {
    while let Some(op) = rx.recv().await {
        let store = store.clone();
        let instance = instance_id.clone();
        let result = tokio::task::spawn_blocking(move || apply(&store, &instance, op)).await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(instance = %instance_id, error = %e, "failed to persist entity state"),
            Err(e) => warn!(instance = %instance_id, error = %e, "entity persistence task panicked"),
        }
    }
    debug!(instance = %instance_id, "entity persistence writer drained");
}

fn apply(store: &Store, instance_id: &str, op: PersistOp) -> crate::error::StoreResult<()> {
    match op {
        PersistOp::Upsert {
            state,
            previous_value,
        } => {
            store.upsert_entity(instance_id, &state)?;
            if let Some(previous) = previous_value {
                if previous != state.state {
                    store.record_state_change(
                        instance_id,
                        &state.entity_id,
                        Some(&previous),
                        &state.state,
                        Utc::now(),
                    )?;
                }
            }
            Ok(())
        }
        PersistOp::Delete(entity_id) => store.delete_entity(instance_id, &entity_id),
    }
}
