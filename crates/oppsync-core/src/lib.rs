//! Core domain model for oppsync: opportunity records and sync-run bookkeeping.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppsync-core";

/// Normalized contracting notice as produced by the upstream adapter.
///
/// `opportunity_id` is the upstream `noticeId`. It may be blank when the
/// upstream element is malformed; such records are rejected at reconciliation
/// time rather than silently dropped during normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OpportunityRecord {
    pub opportunity_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub solicitation_number: Option<String>,
    pub notice_type: Option<String>,
    pub base_type: Option<String>,
    pub naics_code: Option<String>,
    pub classification_code: Option<String>,
    pub department: Option<String>,
    pub sub_tier: Option<String>,
    pub office: Option<String>,
    pub full_parent_path: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub set_aside_code: Option<String>,
    pub set_aside_description: Option<String>,
    pub active: Option<bool>,
    pub award_amount: Option<Decimal>,
    pub award_date: Option<NaiveDate>,
    pub award_number: Option<String>,
    pub awardee_name: Option<String>,
    pub awardee_uei: Option<String>,
    pub awardee_city: Option<String>,
    pub awardee_state: Option<String>,
    pub ui_link: Option<String>,
    /// Verbatim upstream element. Never interpreted after normalization.
    pub raw_payload: JsonValue,
}

impl OpportunityRecord {
    /// Returns the trimmed natural key, or `None` when the upstream id is missing.
    pub fn natural_key(&self) -> Option<&str> {
        let key = self.opportunity_id.trim();
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSyncStatus {
    Synced,
    Error,
}

impl RecordSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSyncStatus::Synced => "synced",
            RecordSyncStatus::Error => "error",
        }
    }
}

impl FromStr for RecordSyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(RecordSyncStatus::Synced),
            "error" => Ok(RecordSyncStatus::Error),
            other => Err(ParseEnumError::new("record sync status", other)),
        }
    }
}

/// Persisted opportunity with storage and sync metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOpportunity {
    pub id: Uuid,
    /// Optimistic concurrency counter, bumped on every update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync_status: RecordSyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_error: Option<String>,
    pub record: OpportunityRecord,
}

impl StoredOpportunity {
    pub fn opportunity_id(&self) -> &str {
        &self.record.opportunity_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Invocation context of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    #[default]
    Manual,
    Scheduled,
    Api,
    Cli,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Manual => "manual",
            SyncType::Scheduled => "scheduled",
            SyncType::Api => "api",
            SyncType::Cli => "cli",
        }
    }
}

impl FromStr for SyncType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(SyncType::Manual),
            "scheduled" => Ok(SyncType::Scheduled),
            "api" => Ok(SyncType::Api),
            "cli" => Ok(SyncType::Cli),
            other => Err(ParseEnumError::new("sync type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Completed,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncRunStatus::Running)
    }
}

impl FromStr for SyncRunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncRunStatus::Running),
            "completed" => Ok(SyncRunStatus::Completed),
            "failed" => Ok(SyncRunStatus::Failed),
            other => Err(ParseEnumError::new("sync run status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncCounters {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

impl SyncCounters {
    pub fn absorb(&mut self, other: SyncCounters) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.failed += other.failed;
    }

    /// Field-wise maximum. Used by stores so a stale flush can never move a
    /// counter backwards.
    pub fn max_merge(self, other: SyncCounters) -> SyncCounters {
        SyncCounters {
            processed: self.processed.max(other.processed),
            created: self.created.max(other.created),
            updated: self.updated.max(other.updated),
            failed: self.failed.max(other.failed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    Fetch,
    Batch,
    Record,
}

/// One structured entry of a run's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub scope: ErrorScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl SyncErrorEntry {
    pub fn fetch(message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            scope: ErrorScope::Fetch,
            opportunity_id: None,
            batch_index: None,
            message: message.into(),
            occurred_at,
        }
    }

    pub fn batch(batch_index: usize, message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            scope: ErrorScope::Batch,
            opportunity_id: None,
            batch_index: Some(batch_index),
            message: message.into(),
            occurred_at,
        }
    }

    pub fn record(
        batch_index: usize,
        opportunity_id: Option<String>,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            scope: ErrorScope::Record,
            opportunity_id,
            batch_index: Some(batch_index),
            message: message.into(),
            occurred_at,
        }
    }
}

/// Caller-supplied parameters of a sync run, recorded verbatim on the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    pub posted_from: String,
    pub posted_to: String,
    /// Category (NAICS) filters. Empty means unfiltered.
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub notice_types: Vec<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub sync_type: SyncType,
}

impl SyncParams {
    pub fn new(posted_from: impl Into<String>, posted_to: impl Into<String>) -> Self {
        Self {
            posted_from: posted_from.into(),
            posted_to: posted_to.into(),
            naics_codes: Vec::new(),
            notice_types: Vec::new(),
            department: None,
            dry_run: false,
            sync_type: SyncType::default(),
        }
    }
}

/// One orchestrator invocation as persisted in the sync run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub sync_type: SyncType,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counters: SyncCounters,
    pub errors: Vec<SyncErrorEntry>,
    pub params: JsonValue,
    pub notes: Option<String>,
}

impl SyncRun {
    pub fn start(params: &SyncParams, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sync_type: params.sync_type,
            status: SyncRunStatus::Running,
            started_at,
            finished_at: None,
            duration_ms: None,
            counters: SyncCounters::default(),
            errors: Vec::new(),
            params: serde_json::to_value(params).unwrap_or(JsonValue::Null),
            notes: if params.dry_run {
                Some("dry run".to_string())
            } else {
                None
            },
        }
    }
}

/// Partial update applied to a running sync run. `None` fields are left as-is.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncRunUpdate {
    pub status: Option<SyncRunStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counters: Option<SyncCounters>,
    pub errors: Option<Vec<SyncErrorEntry>>,
    pub notes: Option<String>,
}

impl SyncRunUpdate {
    pub fn progress(counters: SyncCounters, errors: Vec<SyncErrorEntry>) -> Self {
        Self {
            counters: Some(counters),
            errors: Some(errors),
            ..Default::default()
        }
    }
}

/// Summary returned to the caller once a run has terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub run_id: Uuid,
    pub status: SyncRunStatus,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub errors: Vec<SyncErrorEntry>,
    pub duration_ms: i64,
}
