//! Fakes shared by this crate's tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oppsync_adapters::{ApiError, PageInfo, SearchApi, SearchPage, SearchParams};
use oppsync_core::{OpportunityRecord, StoredOpportunity, SyncRun, SyncRunUpdate};
use oppsync_storage::{
    MemoryOpportunityStore, MemorySyncRunStore, OpportunityStore, StoreError, SyncRunStore,
};
use uuid::Uuid;

pub fn record(id: &str) -> OpportunityRecord {
    OpportunityRecord {
        opportunity_id: id.to_string(),
        title: Some(format!("Notice {id}")),
        raw_payload: serde_json::json!({ "noticeId": id }),
        ..Default::default()
    }
}

pub fn records(prefix: &str, n: usize) -> Vec<OpportunityRecord> {
    (0..n).map(|i| record(&format!("{prefix}-{i}"))).collect()
}

/// Serves pages out of fixed per-category datasets.
#[derive(Default)]
pub struct FakeSearchApi {
    datasets: BTreeMap<String, Vec<OpportunityRecord>>,
    reported_total: Option<u64>,
    fail_at_offset: Option<u64>,
    calls: Mutex<Vec<SearchParams>>,
}

impl FakeSearchApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(mut self, naics: Option<&str>, records: Vec<OpportunityRecord>) -> Self {
        self.datasets
            .insert(naics.unwrap_or_default().to_string(), records);
        self
    }

    pub fn with_reported_total(mut self, total: u64) -> Self {
        self.reported_total = Some(total);
        self
    }

    pub fn failing_at_offset(mut self, offset: u64) -> Self {
        self.fail_at_offset = Some(offset);
        self
    }

    pub fn calls(&self) -> Vec<SearchParams> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchApi for FakeSearchApi {
    async fn search(&self, params: &SearchParams) -> Result<SearchPage, ApiError> {
        self.calls.lock().unwrap().push(params.clone());
        if self.fail_at_offset == Some(params.offset) {
            return Err(ApiError::Status {
                status: 503,
                message: "upstream maintenance".into(),
                attempts: 4,
            });
        }

        let key = params.filters.naics_code.clone().unwrap_or_default();
        let dataset = self.datasets.get(&key).cloned().unwrap_or_default();
        let start = (params.offset as usize).min(dataset.len());
        let end = (start + params.limit as usize).min(dataset.len());
        Ok(SearchPage {
            records: dataset[start..end].to_vec(),
            total_count: self.reported_total.unwrap_or(dataset.len() as u64),
            page_info: PageInfo {
                limit: params.limit as u64,
                offset: params.offset,
                page_number: None,
                total_pages: None,
            },
            warnings: Vec::new(),
        })
    }
}

/// Memory store that fails chosen ids the way a real database would.
#[derive(Default)]
pub struct FlakyOpportunityStore {
    pub inner: MemoryOpportunityStore,
    rejected: HashSet<String>,
    unavailable: HashSet<String>,
    /// Number of updates that lose a race against a simulated concurrent writer.
    racing_updates: AtomicUsize,
}

impl FlakyOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, id: &str) -> Self {
        self.rejected.insert(id.to_string());
        self
    }

    pub fn unavailable_on(mut self, id: &str) -> Self {
        self.unavailable.insert(id.to_string());
        self
    }

    pub fn racing_updates(self, n: usize) -> Self {
        self.racing_updates.store(n, Ordering::SeqCst);
        self
    }

    fn check(&self, id: &str) -> Result<(), StoreError> {
        if self.unavailable.contains(id) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        if self.rejected.contains(id) {
            return Err(StoreError::Rejected(format!("value too long for {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl OpportunityStore for FlakyOpportunityStore {
    async fn find_by_natural_key(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<StoredOpportunity>, StoreError> {
        self.inner.find_by_natural_key(opportunity_id).await
    }

    async fn create(
        &self,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError> {
        self.check(&record.opportunity_id)?;
        self.inner.create(record, synced_at).await
    }

    async fn update(
        &self,
        opportunity_id: &str,
        expected_version: i64,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError> {
        self.check(opportunity_id)?;
        let race = self
            .racing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if race {
            self.inner
                .update(opportunity_id, expected_version, record, synced_at)
                .await?;
        }
        self.inner
            .update(opportunity_id, expected_version, record, synced_at)
            .await
    }

    async fn mark_error(
        &self,
        opportunity_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.mark_error(opportunity_id, message, at).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }
}

/// Run store that remembers the state of the run after every write.
#[derive(Default)]
pub struct RecordingRunStore {
    pub inner: MemorySyncRunStore,
    pub snapshots: Mutex<Vec<SyncRun>>,
    pub fail_creates: bool,
}

impl RecordingRunStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshots(&self) -> Vec<SyncRun> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncRunStore for RecordingRunStore {
    async fn create(&self, run: &SyncRun) -> Result<(), StoreError> {
        if self.fail_creates {
            return Err(StoreError::Unavailable("run log offline".into()));
        }
        self.inner.create(run).await?;
        self.snapshots.lock().unwrap().push(run.clone());
        Ok(())
    }

    async fn update(&self, id: Uuid, update: &SyncRunUpdate) -> Result<SyncRun, StoreError> {
        let run = self.inner.update(id, update).await?;
        self.snapshots.lock().unwrap().push(run.clone());
        Ok(run)
    }

    async fn get_recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.inner.get_recent(limit).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        self.inner.get_by_id(id).await
    }
}
