//! In-memory stores with the same semantics as the Postgres ones.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oppsync_core::{OpportunityRecord, RecordSyncStatus, StoredOpportunity, SyncRun, SyncRunUpdate};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{apply_run_update, OpportunityStore, StoreError, SyncRunStore};

#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    records: Mutex<BTreeMap<String, StoredOpportunity>>,
    mutations: AtomicU64,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create/update calls observed.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<StoredOpportunity> {
        self.records.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn find_by_natural_key(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<StoredOpportunity>, StoreError> {
        Ok(self.records.lock().await.get(opportunity_id).cloned())
    }

    async fn create(
        &self,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.opportunity_id) {
            return Err(StoreError::AlreadyExists(record.opportunity_id.clone()));
        }
        let stored = StoredOpportunity {
            id: Uuid::new_v4(),
            version: 1,
            created_at: synced_at,
            updated_at: synced_at,
            sync_status: RecordSyncStatus::Synced,
            last_synced_at: Some(synced_at),
            sync_error: None,
            record: record.clone(),
        };
        records.insert(record.opportunity_id.clone(), stored.clone());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn update(
        &self,
        opportunity_id: &str,
        expected_version: i64,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError> {
        let mut records = self.records.lock().await;
        let existing = records
            .get_mut(opportunity_id)
            .ok_or_else(|| StoreError::NotFound(opportunity_id.to_string()))?;
        if existing.version != expected_version {
            return Err(StoreError::VersionConflict {
                opportunity_id: opportunity_id.to_string(),
                expected: expected_version,
            });
        }
        existing.version += 1;
        existing.updated_at = synced_at;
        existing.last_synced_at = Some(synced_at);
        existing.sync_status = RecordSyncStatus::Synced;
        existing.sync_error = None;
        existing.record = OpportunityRecord {
            opportunity_id: opportunity_id.to_string(),
            ..record.clone()
        };
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(existing.clone())
    }

    async fn mark_error(
        &self,
        opportunity_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let existing = records
            .get_mut(opportunity_id)
            .ok_or_else(|| StoreError::NotFound(opportunity_id.to_string()))?;
        existing.sync_status = RecordSyncStatus::Error;
        existing.sync_error = Some(message.to_string());
        existing.updated_at = at;
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.records.lock().await.len() as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemorySyncRunStore {
    runs: Mutex<Vec<SyncRun>>,
}

impl MemorySyncRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncRunStore for MemorySyncRunStore {
    async fn create(&self, run: &SyncRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        if runs.iter().any(|r| r.id == run.id) {
            return Err(StoreError::Rejected(format!("sync run {} already exists", run.id)));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn update(&self, id: Uuid, update: &SyncRunUpdate) -> Result<SyncRun, StoreError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_run_update(run, update)?;
        Ok(run.clone())
    }

    async fn get_recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let mut runs = self.runs.lock().await.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        Ok(self.runs.lock().await.iter().find(|r| r.id == id).cloned())
    }
}
