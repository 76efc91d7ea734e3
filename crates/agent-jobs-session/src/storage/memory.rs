//! In-memory execution record storage.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use agent_jobs_core::{
    ExecutionId, ExecutionMetadata, ExecutionRecord, ExecutionStore, StatusUpdate, StoreError,
    new_execution_id,
};
use async_trait::async_trait;
use chrono::Utc;

/// In-memory storage implementation.
///
/// Records expire after their ttl: reads treat them as absent and
/// [`MemoryStore::purge_expired`] reclaims them. Data is lost on restart.
pub struct MemoryStore {
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
    completed: AtomicU64,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            completed: AtomicU64::new(0),
        }
    }

    /// Drop expired records. Returns how many were removed.
    ///
    /// # Errors
    /// Returns error if the record map is poisoned.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok(before - records.len())
    }

    /// Periodically purge expired records until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.purge_expired() {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Purged {n} expired execution records"),
                    Err(e) => tracing::error!("Failed to purge execution records: {e}"),
                }
            }
        })
    }

    /// Number of records held, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().map_or(0, |r| r.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create(
        &self,
        kind: &str,
        metadata: ExecutionMetadata,
        ttl: Duration,
    ) -> Result<ExecutionId, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut id = new_execution_id(kind);
        while records.contains_key(&id) {
            id = new_execution_id(kind);
        }

        let record = ExecutionRecord::new(id.clone(), kind, metadata, ttl, Utc::now());
        records.insert(id.clone(), record);
        Ok(id)
    }

    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = records
            .get_mut(id)
            .filter(|r| !r.is_expired(now))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        record.apply(update, now)
    }

    async fn get(&self, id: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let now = Utc::now();
        Ok(self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(id)
            .filter(|r| !r.is_expired(now))
            .cloned())
    }

    async fn list_active_ids(&self) -> Result<Vec<ExecutionId>, StoreError> {
        let now = Utc::now();
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut active: Vec<&ExecutionRecord> = records
            .values()
            .filter(|r| !r.status.is_terminal() && !r.is_expired(now))
            .collect();

        // Oldest first
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(active.into_iter().map(|r| r.id.clone()).collect())
    }

    async fn increment_completed_counter(&self) -> Result<u64, StoreError> {
        Ok(self.completed.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn completed_count(&self) -> Result<u64, StoreError> {
        Ok(self.completed.load(Ordering::SeqCst))
    }
}
