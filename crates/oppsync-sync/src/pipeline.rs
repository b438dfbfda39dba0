//! Sync orchestrator: fetch, reconcile in batches, and keep the run log current.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use oppsync_adapters::{ApiError, SearchFilters};
use oppsync_core::{
    OpportunityRecord, SyncCounters, SyncErrorEntry, SyncParams, SyncResult, SyncRun,
    SyncRunStatus, SyncRunUpdate,
};
use oppsync_storage::{OpportunityStore, StoreError, SyncRunStore};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::fetch::BulkFetcher;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("could not open sync run in the run log: {0}")]
    RunLog(#[source] StoreError),
}

/// Why a single record could not be reconciled.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("record has no opportunity id")]
    MissingKey,
    #[error("version conflict on {opportunity_id} persisted after {attempts} attempt(s)")]
    Conflict {
        opportunity_id: String,
        attempts: usize,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Failures that mean storage as a whole is gone, not just this record.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, ReconcileError::Store(err) if err.is_unavailable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_conflict_retries: usize,
    pub max_recorded_errors: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_millis(100),
            max_conflict_retries: 3,
            max_recorded_errors: 500,
        }
    }
}

/// Counters and the capped error list of one run in progress.
#[derive(Debug)]
struct RunLedger {
    counters: SyncCounters,
    errors: Vec<SyncErrorEntry>,
    dropped_errors: usize,
    cap: usize,
}

impl RunLedger {
    fn new(cap: usize) -> Self {
        Self {
            counters: SyncCounters::default(),
            errors: Vec::new(),
            dropped_errors: 0,
            cap: cap.max(1),
        }
    }

    fn push_error(&mut self, entry: SyncErrorEntry) {
        if self.errors.len() < self.cap {
            self.errors.push(entry);
        } else {
            self.dropped_errors += 1;
        }
    }

    fn has_failures(&self) -> bool {
        self.counters.failed > 0 || !self.errors.is_empty() || self.dropped_errors > 0
    }

    fn overflow_note(&self) -> Option<String> {
        (self.dropped_errors > 0)
            .then(|| format!("{} further error(s) not recorded", self.dropped_errors))
    }
}

/// Outcome of one batch before it is folded into the ledger.
#[derive(Debug, Default)]
struct BatchOutcome {
    counters: SyncCounters,
    errors: Vec<SyncErrorEntry>,
}

pub struct SyncOrchestrator {
    fetcher: BulkFetcher,
    opportunities: Arc<dyn OpportunityStore>,
    runs: Arc<dyn SyncRunStore>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        fetcher: BulkFetcher,
        opportunities: Arc<dyn OpportunityStore>,
        runs: Arc<dyn SyncRunStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            fetcher,
            opportunities,
            runs,
            config,
        }
    }

    pub fn runs(&self) -> Arc<dyn SyncRunStore> {
        self.runs.clone()
    }

    /// Runs the pipeline to completion. Only fails when the run could not be
    /// opened in the run log; every later failure is reported in the result.
    pub async fn run_sync(&self, params: SyncParams) -> Result<SyncResult, SyncError> {
        let run = SyncRun::start(&params, Utc::now());
        self.runs.create(&run).await.map_err(SyncError::RunLog)?;

        let span = info_span!(
            "sync_run",
            run_id = %run.id,
            sync_type = params.sync_type.as_str(),
            dry_run = params.dry_run
        );
        Ok(self.execute(run, params).instrument(span).await)
    }

    async fn execute(&self, run: SyncRun, params: SyncParams) -> SyncResult {
        info!(
            posted_from = %params.posted_from,
            posted_to = %params.posted_to,
            naics = ?params.naics_codes,
            "sync run started"
        );
        let mut ledger = RunLedger::new(self.config.max_recorded_errors);

        let records = match self.fetch_records(&params).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "fetch failed; no batches processed");
                ledger.push_error(SyncErrorEntry::fetch(err.to_string(), Utc::now()));
                return self.finalize(&run, &ledger).await;
            }
        };

        let batch_size = self.config.batch_size.max(1);
        let batch_count = records.len().div_ceil(batch_size);
        for (index, batch) in records.chunks(batch_size).enumerate() {
            if index > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            let outcome = self.process_batch(index, batch, params.dry_run).await;
            ledger.counters.absorb(outcome.counters);
            for entry in outcome.errors {
                ledger.push_error(entry);
            }
            debug!(
                batch = index + 1,
                batches = batch_count,
                processed = ledger.counters.processed,
                failed = ledger.counters.failed,
                "batch complete"
            );
            self.flush(run.id, &ledger).await;
        }

        self.finalize(&run, &ledger).await
    }

    async fn fetch_records(&self, params: &SyncParams) -> Result<Vec<OpportunityRecord>, ApiError> {
        let codes: Vec<Option<String>> = if params.naics_codes.is_empty() {
            vec![None]
        } else {
            params.naics_codes.iter().cloned().map(Some).collect()
        };

        let mut records = Vec::new();
        for naics_code in codes {
            let filters = SearchFilters {
                naics_code,
                notice_types: params.notice_types.clone(),
                department: params.department.clone(),
            };
            let fetched = self
                .fetcher
                .fetch_all(&params.posted_from, &params.posted_to, &filters)
                .await?;
            records.extend(fetched);
        }

        let fetched = records.len();
        let records = dedupe_by_natural_key(records);
        if records.len() < fetched {
            debug!(
                fetched,
                unique = records.len(),
                "dropped duplicate records across category fetches"
            );
        }
        Ok(records)
    }

    async fn process_batch(
        &self,
        index: usize,
        batch: &[OpportunityRecord],
        dry_run: bool,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if dry_run {
            outcome.counters.processed = batch.len() as u64;
            return outcome;
        }

        for record in batch {
            match self.reconcile(record).await {
                Ok(reconciled) => {
                    outcome.counters.processed += 1;
                    match reconciled {
                        Reconciled::Created => outcome.counters.created += 1,
                        Reconciled::Updated => outcome.counters.updated += 1,
                    }
                }
                Err(err) if err.is_batch_fatal() => {
                    error!(batch = index, error = %err, "storage unavailable; batch abandoned");
                    let size = batch.len() as u64;
                    return BatchOutcome {
                        counters: SyncCounters {
                            processed: size,
                            failed: size,
                            ..Default::default()
                        },
                        errors: vec![SyncErrorEntry::batch(index, err.to_string(), Utc::now())],
                    };
                }
                Err(err) => {
                    let opportunity_id = record.natural_key().map(str::to_string);
                    warn!(
                        batch = index,
                        opportunity_id = opportunity_id.as_deref().unwrap_or(""),
                        error = %err,
                        "record failed to reconcile"
                    );
                    if let Some(id) = opportunity_id.as_deref() {
                        self.flag_record_error(id, &err).await;
                    }
                    outcome.counters.processed += 1;
                    outcome.counters.failed += 1;
                    outcome.errors.push(SyncErrorEntry::record(
                        index,
                        opportunity_id,
                        err.to_string(),
                        Utc::now(),
                    ));
                }
            }
        }
        outcome
    }

    /// Create-or-update by natural key with an optimistic version check. A lost
    /// race re-reads the stored row and tries again.
    pub async fn reconcile(&self, record: &OpportunityRecord) -> Result<Reconciled, ReconcileError> {
        let key = record.natural_key().ok_or(ReconcileError::MissingKey)?;
        let record: Cow<'_, OpportunityRecord> = if key == record.opportunity_id {
            Cow::Borrowed(record)
        } else {
            Cow::Owned(OpportunityRecord {
                opportunity_id: key.to_string(),
                ..record.clone()
            })
        };
        let synced_at = Utc::now();
        let attempts = self.config.max_conflict_retries + 1;

        for attempt in 1..=attempts {
            match self.opportunities.find_by_natural_key(key).await? {
                Some(existing) => {
                    match self
                        .opportunities
                        .update(key, existing.version, &record, synced_at)
                        .await
                    {
                        Ok(_) => return Ok(Reconciled::Updated),
                        Err(StoreError::VersionConflict { .. } | StoreError::NotFound(_)) => {
                            debug!(opportunity_id = key, attempt, "lost update race; re-reading");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                None => match self.opportunities.create(&record, synced_at).await {
                    Ok(_) => return Ok(Reconciled::Created),
                    Err(StoreError::AlreadyExists(_)) => {
                        debug!(opportunity_id = key, attempt, "lost create race; re-reading");
                    }
                    Err(err) => return Err(err.into()),
                },
            }
        }

        Err(ReconcileError::Conflict {
            opportunity_id: key.to_string(),
            attempts,
        })
    }

    /// Marks an already stored row as out of sync. Ids that were never stored
    /// have nothing to mark.
    async fn flag_record_error(&self, opportunity_id: &str, err: &ReconcileError) {
        match self
            .opportunities
            .mark_error(opportunity_id, &err.to_string(), Utc::now())
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(mark_err) => {
                warn!(opportunity_id, error = %mark_err, "could not flag record sync error");
            }
        }
    }

    async fn flush(&self, run_id: Uuid, ledger: &RunLedger) {
        let update = SyncRunUpdate::progress(ledger.counters, ledger.errors.clone());
        if let Err(err) = self.runs.update(run_id, &update).await {
            warn!(error = %err, "could not flush run progress");
        }
    }

    async fn finalize(&self, run: &SyncRun, ledger: &RunLedger) -> SyncResult {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - run.started_at).num_milliseconds().max(0);
        let status = if ledger.has_failures() {
            SyncRunStatus::Failed
        } else {
            SyncRunStatus::Completed
        };

        let notes = match (run.notes.as_deref(), ledger.overflow_note()) {
            (Some(existing), Some(overflow)) => Some(format!("{existing}; {overflow}")),
            (None, Some(overflow)) => Some(overflow),
            _ => None,
        };
        let update = SyncRunUpdate {
            status: Some(status),
            finished_at: Some(finished_at),
            duration_ms: Some(duration_ms),
            counters: Some(ledger.counters),
            errors: Some(ledger.errors.clone()),
            notes,
        };
        if let Err(err) = self.runs.update(run.id, &update).await {
            error!(error = %err, "could not finalize run in the run log");
        }

        let c = ledger.counters;
        info!(
            status = status.as_str(),
            processed = c.processed,
            created = c.created,
            updated = c.updated,
            failed = c.failed,
            duration_ms,
            "sync run finished"
        );
        SyncResult {
            success: status == SyncRunStatus::Completed,
            run_id: run.id,
            status,
            processed: c.processed,
            created: c.created,
            updated: c.updated,
            failed: c.failed,
            errors: ledger.errors.clone(),
            duration_ms,
        }
    }
}

/// Keeps the first occurrence of each natural key. Records without a key pass
/// through so they are reported as failures.
pub fn dedupe_by_natural_key(records: Vec<OpportunityRecord>) -> Vec<OpportunityRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| match record.natural_key() {
            Some(key) => seen.insert(key.to_string()),
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, records, FakeSearchApi, FlakyOpportunityStore, RecordingRunStore};
    use oppsync_core::{ErrorScope, RecordSyncStatus, SyncType};
    use oppsync_storage::MemoryOpportunityStore;

    fn orchestrator(
        api: FakeSearchApi,
        page_size: u32,
        batch_size: usize,
        store: Arc<dyn OpportunityStore>,
        runs: Arc<dyn SyncRunStore>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            BulkFetcher::new(Arc::new(api), page_size, Duration::ZERO),
            store,
            runs,
            OrchestratorConfig {
                batch_size,
                batch_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn june_params() -> SyncParams {
        SyncParams {
            naics_codes: vec!["541512".into()],
            ..SyncParams::new("2025-06-01", "2025-06-16")
        }
    }

    #[tokio::test]
    async fn four_new_records_are_created_in_one_batch() {
        let api = Arc::new(
            FakeSearchApi::new().with_records(Some("541512"), records("opp", 4)),
        );
        let store = Arc::new(MemoryOpportunityStore::new());
        let runs = RecordingRunStore::new();
        let orchestrator = SyncOrchestrator::new(
            BulkFetcher::new(api.clone(), 2, Duration::ZERO),
            store.clone(),
            runs.clone(),
            OrchestratorConfig {
                batch_size: 4,
                batch_delay: Duration::ZERO,
                ..Default::default()
            },
        );

        let result = orchestrator.run_sync(june_params()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.status, SyncRunStatus::Completed);
        assert_eq!(
            (result.processed, result.created, result.updated, result.failed),
            (4, 4, 0, 0)
        );
        assert!(result.errors.is_empty());
        assert_eq!(api.calls().len(), 2);
        assert_eq!(store.count().await.unwrap(), 4);

        let stored = runs.get_by_id(result.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Completed);
        assert!(stored.finished_at.is_some());
        assert_eq!(stored.duration_ms, Some(result.duration_ms));
        assert_eq!(stored.params["naics_codes"][0], "541512");
        assert_eq!(stored.params["posted_from"], "2025-06-01");
    }

    #[tokio::test]
    async fn rerun_converges_with_updates_only() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let runs = Arc::new(oppsync_storage::MemorySyncRunStore::new());
        let make = || {
            orchestrator(
                FakeSearchApi::new().with_records(Some("541512"), records("opp", 5)),
                2,
                2,
                store.clone(),
                runs.clone(),
            )
        };

        let first = make().run_sync(june_params()).await.unwrap();
        let second = make().run_sync(june_params()).await.unwrap();

        assert_eq!(first.created, 5);
        assert_eq!((second.created, second.updated), (0, 5));
        assert_eq!(store.count().await.unwrap(), 5);
        assert!(store.snapshot().await.iter().all(|s| s.version == 2));
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn one_bad_record_does_not_sink_the_batch() {
        let mut data = records("opp", 4);
        data.insert(2, record("   "));
        let store = Arc::new(FlakyOpportunityStore::new().rejecting("opp-0"));
        let orch = orchestrator(
            FakeSearchApi::new().with_records(None, data),
            10,
            10,
            store.clone(),
            Arc::new(oppsync_storage::MemorySyncRunStore::new()),
        );

        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.status, SyncRunStatus::Failed);
        assert_eq!(result.processed, 5);
        assert_eq!(result.failed, 2);
        assert_eq!(result.created + result.updated, 3);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().all(|e| e.scope == ErrorScope::Record));
        assert_eq!(result.errors[0].opportunity_id.as_deref(), Some("opp-0"));
        assert_eq!(result.errors[1].opportunity_id, None);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn run_log_tracks_each_batch_as_it_completes() {
        let runs = RecordingRunStore::new();
        let orch = orchestrator(
            FakeSearchApi::new().with_records(None, records("opp", 5)),
            5,
            2,
            Arc::new(MemoryOpportunityStore::new()),
            runs.clone(),
        );

        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        let snapshots = runs.snapshots();
        // create, three batch flushes, finalize
        assert_eq!(snapshots.len(), 5);
        assert_eq!(snapshots[0].status, SyncRunStatus::Running);
        assert_eq!(snapshots[0].counters, SyncCounters::default());
        let progress: Vec<u64> = snapshots[1..4].iter().map(|r| r.counters.processed).collect();
        assert_eq!(progress, vec![2, 4, 5]);
        assert!(snapshots[1..4].iter().all(|r| r.status == SyncRunStatus::Running));
        assert_eq!(snapshots[4].status, SyncRunStatus::Completed);
        assert_eq!(snapshots[4].counters.created, 5);
        assert_eq!(result.processed, 5);
    }

    #[tokio::test]
    async fn dry_run_never_touches_storage() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let runs = Arc::new(oppsync_storage::MemorySyncRunStore::new());
        let orch = orchestrator(
            FakeSearchApi::new().with_records(None, records("opp", 3)),
            2,
            2,
            store.clone(),
            runs.clone(),
        );

        let params = SyncParams {
            dry_run: true,
            ..SyncParams::new("2025-06-01", "2025-06-16")
        };
        let result = orch.run_sync(params).await.unwrap();

        assert!(result.success);
        assert_eq!((result.processed, result.created, result.updated), (3, 0, 0));
        assert_eq!(store.mutation_count(), 0);
        assert_eq!(store.count().await.unwrap(), 0);
        let stored = runs.get_by_id(result.run_id).await.unwrap().unwrap();
        assert_eq!(stored.notes.as_deref(), Some("dry run"));
    }

    #[tokio::test]
    async fn unavailable_storage_fails_the_batch_and_moves_on() {
        let store = Arc::new(FlakyOpportunityStore::new().unavailable_on("opp-1"));
        let orch = orchestrator(
            FakeSearchApi::new().with_records(None, records("opp", 6)),
            10,
            3,
            store.clone(),
            Arc::new(oppsync_storage::MemorySyncRunStore::new()),
        );

        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        assert_eq!(result.status, SyncRunStatus::Failed);
        assert_eq!(result.processed, 6);
        assert_eq!(result.failed, 3);
        assert_eq!(result.created, 3);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].scope, ErrorScope::Batch);
        assert_eq!(result.errors[0].batch_index, Some(0));
        assert!(store.inner.find_by_natural_key("opp-5").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fetch_failure_finalizes_without_batches() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let runs = Arc::new(oppsync_storage::MemorySyncRunStore::new());
        let orch = orchestrator(
            FakeSearchApi::new()
                .with_records(None, records("opp", 4))
                .failing_at_offset(2),
            2,
            2,
            store.clone(),
            runs.clone(),
        );

        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.processed, 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].scope, ErrorScope::Fetch);
        assert!(result.errors[0].message.contains("503"));
        assert_eq!(store.mutation_count(), 0);
        let stored = runs.get_by_id(result.run_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Failed);
    }

    #[tokio::test]
    async fn run_log_outage_at_start_is_an_error() {
        let runs = Arc::new(RecordingRunStore {
            fail_creates: true,
            ..Default::default()
        });
        let api = FakeSearchApi::new().with_records(None, records("opp", 1));
        let orch = orchestrator(api, 2, 2, Arc::new(MemoryOpportunityStore::new()), runs);

        let err = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RunLog(_)));
    }

    #[tokio::test]
    async fn lost_update_races_are_retried() {
        let store = Arc::new(FlakyOpportunityStore::new().racing_updates(2));
        store.inner.create(&record("opp-0"), Utc::now()).await.unwrap();
        let orch = orchestrator(
            FakeSearchApi::new(),
            2,
            2,
            store.clone(),
            Arc::new(oppsync_storage::MemorySyncRunStore::new()),
        );

        let outcome = orch.reconcile(&record("opp-0")).await.unwrap();
        assert_eq!(outcome, Reconciled::Updated);
        // two racing writes plus the winning update
        let stored = store.inner.find_by_natural_key("opp-0").await.unwrap().unwrap();
        assert_eq!(stored.version, 4);
    }

    #[tokio::test]
    async fn persistent_conflicts_become_record_failures() {
        let store = Arc::new(FlakyOpportunityStore::new().racing_updates(100));
        store.inner.create(&record("opp-0"), Utc::now()).await.unwrap();
        let orch = orchestrator(
            FakeSearchApi::new(),
            2,
            2,
            store,
            Arc::new(oppsync_storage::MemorySyncRunStore::new()),
        );

        let err = orch.reconcile(&record("opp-0")).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict { attempts: 4, .. }));
        assert!(!err.is_batch_fatal());
    }

    #[tokio::test]
    async fn multiple_categories_are_fetched_and_deduplicated() {
        let mut shared = record("shared");
        shared.naics_code = Some("541512".into());
        let mut second = vec![record("b-0"), record("shared")];
        second[1].naics_code = Some("541519".into());
        let api = Arc::new(
            FakeSearchApi::new()
                .with_records(Some("541512"), vec![record("a-0"), shared])
                .with_records(Some("541519"), second),
        );
        let store = Arc::new(MemoryOpportunityStore::new());
        let orch = SyncOrchestrator::new(
            BulkFetcher::new(api.clone(), 10, Duration::ZERO),
            store.clone(),
            Arc::new(oppsync_storage::MemorySyncRunStore::new()),
            OrchestratorConfig::default(),
        );

        let params = SyncParams {
            naics_codes: vec!["541512".into(), "541519".into()],
            sync_type: SyncType::Api,
            ..SyncParams::new("2025-06-01", "2025-06-16")
        };
        let result = orch.run_sync(params).await.unwrap();

        assert_eq!(api.calls().len(), 2);
        assert_eq!(result.processed, 3);
        assert_eq!(result.created, 3);
        let shared = store.find_by_natural_key("shared").await.unwrap().unwrap();
        assert_eq!(shared.record.naics_code.as_deref(), Some("541512"));
    }

    #[tokio::test]
    async fn error_list_is_capped_with_a_note() {
        let data: Vec<_> = (0..5).map(|_| record("")).collect();
        let runs = Arc::new(oppsync_storage::MemorySyncRunStore::new());
        let orch = SyncOrchestrator::new(
            BulkFetcher::new(
                Arc::new(FakeSearchApi::new().with_records(None, data)),
                10,
                Duration::ZERO,
            ),
            Arc::new(MemoryOpportunityStore::new()),
            runs.clone(),
            OrchestratorConfig {
                batch_delay: Duration::ZERO,
                max_recorded_errors: 2,
                ..Default::default()
            },
        );

        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        assert_eq!(result.failed, 5);
        assert_eq!(result.errors.len(), 2);
        let stored = runs.get_by_id(result.run_id).await.unwrap().unwrap();
        assert_eq!(stored.notes.as_deref(), Some("3 further error(s) not recorded"));
    }

    #[tokio::test]
    async fn failed_run_keeps_an_error_even_with_zero_cap() {
        let runs = Arc::new(oppsync_storage::MemorySyncRunStore::new());
        let orch = SyncOrchestrator::new(
            BulkFetcher::new(
                Arc::new(FakeSearchApi::new().with_records(None, vec![record(""), record("")])),
                10,
                Duration::ZERO,
            ),
            Arc::new(MemoryOpportunityStore::new()),
            runs.clone(),
            OrchestratorConfig {
                batch_delay: Duration::ZERO,
                max_recorded_errors: 0,
                ..Default::default()
            },
        );

        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.failed, 2);
        assert_eq!(result.errors.len(), 1);
        let stored = runs.get_by_id(result.run_id).await.unwrap().unwrap();
        assert_eq!(stored.errors.len(), 1);
        assert_eq!(stored.notes.as_deref(), Some("1 further error(s) not recorded"));
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_spaced_by_the_batch_delay() {
        let orch = SyncOrchestrator::new(
            BulkFetcher::new(
                Arc::new(FakeSearchApi::new().with_records(None, records("opp", 5))),
                10,
                Duration::ZERO,
            ),
            Arc::new(MemoryOpportunityStore::new()),
            Arc::new(oppsync_storage::MemorySyncRunStore::new()),
            OrchestratorConfig {
                batch_size: 2,
                batch_delay: Duration::from_millis(100),
                ..Default::default()
            },
        );

        let started = tokio::time::Instant::now();
        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        // three batches, no pause before the first
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(result.created, 5);
    }

    #[tokio::test]
    async fn rejected_update_flags_the_stored_row() {
        let store = Arc::new(FlakyOpportunityStore::new().rejecting("opp-0"));
        store.inner.create(&record("opp-0"), Utc::now()).await.unwrap();
        let orch = orchestrator(
            FakeSearchApi::new().with_records(None, records("opp", 2)),
            10,
            10,
            store.clone(),
            Arc::new(oppsync_storage::MemorySyncRunStore::new()),
        );

        let result = orch
            .run_sync(SyncParams::new("2025-06-01", "2025-06-16"))
            .await
            .unwrap();

        assert_eq!((result.created, result.failed), (1, 1));
        let flagged = store.inner.find_by_natural_key("opp-0").await.unwrap().unwrap();
        assert_eq!(flagged.sync_status, RecordSyncStatus::Error);
        assert!(flagged.sync_error.as_deref().unwrap().contains("value too long"));
        assert_eq!(flagged.version, 1);
        let fresh = store.inner.find_by_natural_key("opp-1").await.unwrap().unwrap();
        assert_eq!(fresh.sync_status, RecordSyncStatus::Synced);
        assert_eq!(fresh.sync_error, None);
    }

    #[test]
    fn dedupe_keeps_first_occurrence_and_keyless_records() {
        let mut later = record("a");
        later.title = Some("later".into());
        let out = dedupe_by_natural_key(vec![record("a"), record(""), later, record("b"), record("")]);
        let ids: Vec<_> = out.iter().map(|r| r.opportunity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "", "b", ""]);
        assert_eq!(out[0].title.as_deref(), Some("Notice a"));
    }
}
