//! Live task state, mirrored to the durable store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

use vocalis_core::{Error, Result, TaskId, TaskRecord, TaskRepository, Transition};

type Entry = Arc<Mutex<TaskRecord>>;

/// Result of [`StatusTracker::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The transition was persisted; holds the new record.
    Applied(TaskRecord),
    /// The decision function declined to change anything.
    Unchanged(TaskRecord),
}

impl UpdateOutcome {
    pub fn record(&self) -> &TaskRecord {
        match self {
            UpdateOutcome::Applied(record) | UpdateOutcome::Unchanged(record) => record,
        }
    }

    pub fn into_record(self) -> TaskRecord {
        match self {
            UpdateOutcome::Applied(record) | UpdateOutcome::Unchanged(record) => record,
        }
    }
}

/// In-memory view of unfinished tasks.
///
/// Writes go to the store first (conditional on the prior status) and only
/// then to memory. Each id has its own lock; the map lock is held only for
/// lookups and for loading an untracked id from the store. Records that
/// reach a terminal status are dropped from memory and served from the store
/// afterwards.
pub struct StatusTracker {
    store: Arc<dyn TaskRepository>,
    entries: RwLock<HashMap<TaskId, Entry>>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn TaskRepository>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskRepository> {
        &self.store
    }

    /// Persist a new record and start tracking it.
    pub async fn insert(&self, record: TaskRecord) -> Result<()> {
        self.store.insert(&record).await?;
        self.entries
            .write()
            .await
            .insert(record.id, Arc::new(Mutex::new(record)));
        Ok(())
    }

    /// Track a record that already exists in the store.
    pub async fn rehydrate(&self, record: TaskRecord) {
        if record.status.is_terminal() {
            return;
        }
        self.entries
            .write()
            .await
            .entry(record.id)
            .or_insert_with(|| Arc::new(Mutex::new(record)));
    }

    /// Current record for `id`, falling back to the store once.
    pub async fn get(&self, id: TaskId) -> Result<TaskRecord> {
        let entry = self.entry(id).await?;
        let record = entry.lock().await.clone();
        Ok(record)
    }

    /// Number of records held in memory.
    pub async fn tracked(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn cached(&self, id: TaskId) -> Option<Entry> {
        self.entries.read().await.get(&id).cloned()
    }

    async fn entry(&self, id: TaskId) -> Result<Entry> {
        if let Some(entry) = self.cached(id).await {
            return Ok(entry);
        }
        // The store is read under the map lock: an eviction racing with this
        // load either lands first (the read sees the terminal record) or
        // waits and removes what was loaded.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&id) {
            return Ok(entry.clone());
        }
        let record = self.store.get(id).await?.ok_or(Error::TaskNotFound(id))?;
        let terminal = record.status.is_terminal();
        let entry = Arc::new(Mutex::new(record));
        if !terminal {
            entries.insert(id, entry.clone());
        }
        Ok(entry)
    }

    /// Apply the transition chosen by `decide` under the task's lock.
    ///
    /// `decide` sees the current record and returns the transition to apply,
    /// `None` to leave the record alone, or an error to abort. The transition
    /// is checked against the state machine, written to the store only if
    /// the stored status still matches, and then written to memory.
    pub async fn update<F>(&self, id: TaskId, decide: F) -> Result<UpdateOutcome>
    where
        F: FnOnce(&TaskRecord) -> Result<Option<Transition>>,
    {
        let entry = self.entry(id).await?;
        let mut current = entry.lock().await;

        let transition = match decide(&current)? {
            Some(transition) => transition,
            None => return Ok(UpdateOutcome::Unchanged(current.clone())),
        };

        let next = current.apply(transition, Utc::now())?;
        let applied = self.store.update_if_status(&next, current.status).await?;
        if !applied {
            error!(
                subsystem = "jobs",
                component = "tracker",
                op = "update",
                task_id = %id,
                status = %current.status,
                "Stored status diverged from tracked status"
            );
            if let Some(stored) = self.store.get(id).await? {
                *current = stored;
            }
            let settled = current.status.is_terminal();
            drop(current);
            if settled {
                self.entries.write().await.remove(&id);
            }
            return Err(Error::InvalidState(format!(
                "task {} was modified concurrently",
                id
            )));
        }

        debug!(
            subsystem = "jobs",
            component = "tracker",
            op = "update",
            task_id = %id,
            from = %current.status,
            status = %next.status,
            "Task transitioned"
        );
        *current = next.clone();
        drop(current);

        if next.status.is_terminal() {
            self.entries.write().await.remove(&id);
        }
        Ok(UpdateOutcome::Applied(next))
    }
}
