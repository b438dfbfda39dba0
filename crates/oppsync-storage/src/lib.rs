//! Persistence contracts and upstream fetch primitives for oppsync.
//!
//! Two stores back the sync pipeline: [`OpportunityStore`] (create-or-update by
//! natural key with an optimistic version check) and [`SyncRunStore`] (the
//! incrementally written sync run log). Both have a Postgres implementation
//! ([`PgStore`]) and an in-memory one used by tests and database-less runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oppsync_core::{OpportunityRecord, StoredOpportunity, SyncRun, SyncRunUpdate};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, Acquire, BackoffPolicy, RateLimitBucket,
    RateLimitConfig, RetryDisposition, SlidingWindow,
};
pub use memory::{MemoryOpportunityStore, MemorySyncRunStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "oppsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("opportunity {0} already exists")]
    AlreadyExists(String),
    #[error("version conflict on opportunity {opportunity_id} (expected version {expected})")]
    VersionConflict { opportunity_id: String, expected: i64 },
    #[error("sync run {0} is already finalized")]
    RunFinalized(Uuid),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage rejected record: {0}")]
    Rejected(String),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    /// True when the backend as a whole is unreachable, as opposed to a
    /// single record being refused.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::Database(db_err) => StoreError::Rejected(db_err.message().to_string()),
            other => StoreError::Database(other),
        }
    }
}

/// Storage boundary for opportunity records, keyed by `opportunity_id`.
///
/// Each call is independently atomic; callers never rely on multi-record
/// transactions.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn find_by_natural_key(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<StoredOpportunity>, StoreError>;

    /// Inserts a new record. Fails with [`StoreError::AlreadyExists`] if a
    /// concurrent writer created the same id first.
    async fn create(
        &self,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError>;

    /// Updates in place if the stored version still equals `expected_version`,
    /// otherwise fails with [`StoreError::VersionConflict`].
    async fn update(
        &self,
        opportunity_id: &str,
        expected_version: i64,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError>;

    /// Flags an existing record as failed to sync. Record data and version
    /// are left as they were. Fails with [`StoreError::NotFound`] for unknown ids.
    async fn mark_error(
        &self,
        opportunity_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

/// Sync run log. Pure data access.
#[async_trait]
pub trait SyncRunStore: Send + Sync {
    async fn create(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Applies a partial update to a running run. Finalized runs are immutable.
    async fn update(&self, id: Uuid, update: &SyncRunUpdate) -> Result<SyncRun, StoreError>;

    async fn get_recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<SyncRun>, StoreError>;
}

/// Update semantics shared by every [`SyncRunStore`]: counters only move
/// forward, and a run that reached a terminal status rejects further writes.
pub fn apply_run_update(run: &mut SyncRun, update: &SyncRunUpdate) -> Result<(), StoreError> {
    if run.status.is_terminal() {
        return Err(StoreError::RunFinalized(run.id));
    }
    if let Some(counters) = update.counters {
        run.counters = run.counters.max_merge(counters);
    }
    if let Some(errors) = &update.errors {
        run.errors = errors.clone();
    }
    if let Some(notes) = &update.notes {
        run.notes = Some(notes.clone());
    }
    if let Some(finished_at) = update.finished_at {
        run.finished_at = Some(finished_at);
    }
    if let Some(duration_ms) = update.duration_ms {
        run.duration_ms = Some(duration_ms);
    }
    if let Some(status) = update.status {
        run.status = status;
    }
    Ok(())
}
