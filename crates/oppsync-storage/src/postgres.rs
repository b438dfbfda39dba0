//! Postgres-backed stores (sqlx, runtime-checked queries).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oppsync_core::{
    OpportunityRecord, RecordSyncStatus, StoredOpportunity, SyncCounters, SyncErrorEntry, SyncRun,
    SyncRunStatus, SyncRunUpdate, SyncType,
};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use crate::{OpportunityStore, StoreError, SyncRunStore};

/// Writable record columns, in bind order.
const RECORD_FIELDS: [&str; 25] = [
    "title",
    "description",
    "solicitation_number",
    "notice_type",
    "base_type",
    "naics_code",
    "classification_code",
    "department",
    "sub_tier",
    "office",
    "full_parent_path",
    "posted_date",
    "response_deadline",
    "set_aside_code",
    "set_aside_description",
    "active",
    "award_amount",
    "award_date",
    "award_number",
    "awardee_name",
    "awardee_uei",
    "awardee_city",
    "awardee_state",
    "ui_link",
    "raw_payload",
];

const OPPORTUNITY_META_COLUMNS: &str =
    "id, opportunity_id, version, sync_status, last_synced_at, sync_error, created_at, updated_at";

const SYNC_RUN_COLUMNS: &str = "id, sync_type, status, started_at, finished_at, duration_ms, \
     processed, created, updated, failed, errors, params, notes";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    async fn opportunity_exists(&self, opportunity_id: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM opportunities WHERE opportunity_id = $1)")
                .bind(opportunity_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

fn opportunity_select_columns() -> String {
    format!("{OPPORTUNITY_META_COLUMNS}, {}", RECORD_FIELDS.join(", "))
}

/// `$1` id, `$2` opportunity_id, `$3` synced_at, then record fields from `$4`.
/// Returns no row when the natural key is already taken.
fn insert_opportunity_sql() -> String {
    let placeholders = (4..4 + RECORD_FIELDS.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"
        INSERT INTO opportunities
            (id, opportunity_id, version, sync_status, last_synced_at, created_at, updated_at, {fields})
        VALUES ($1, $2, 1, 'synced', $3, $3, $3, {placeholders})
        ON CONFLICT (opportunity_id) DO NOTHING
        RETURNING {returning}
        "#,
        fields = RECORD_FIELDS.join(", "),
        returning = opportunity_select_columns(),
    )
}

/// `$1` opportunity_id, `$2` expected version, record fields from `$3`, then
/// synced_at. Returns no row when the version moved on.
fn update_opportunity_sql() -> String {
    let assignments = RECORD_FIELDS
        .iter()
        .enumerate()
        .map(|(i, field)| format!("{field} = ${}", i + 3))
        .collect::<Vec<_>>()
        .join(", ");
    let synced_at_param = RECORD_FIELDS.len() + 3;
    format!(
        r#"
        UPDATE opportunities
           SET {assignments},
               version = version + 1,
               sync_status = 'synced',
               sync_error = NULL,
               last_synced_at = ${synced_at_param},
               updated_at = ${synced_at_param}
         WHERE opportunity_id = $1
           AND version = $2
        RETURNING {returning}
        "#,
        returning = opportunity_select_columns(),
    )
}

const MARK_OPPORTUNITY_ERROR_SQL: &str = r#"
    UPDATE opportunities
       SET sync_status = 'error',
           sync_error = $2,
           updated_at = $3
     WHERE opportunity_id = $1
"#;

/// Counters only move forward and finalized runs match no row.
fn update_run_sql() -> String {
    format!(
        r#"
        UPDATE sync_runs
           SET status = COALESCE($2, status),
               finished_at = COALESCE($3, finished_at),
               duration_ms = COALESCE($4, duration_ms),
               processed = GREATEST(processed, COALESCE($5, processed)),
               created = GREATEST(created, COALESCE($6, created)),
               updated = GREATEST(updated, COALESCE($7, updated)),
               failed = GREATEST(failed, COALESCE($8, failed)),
               errors = COALESCE($9, errors),
               notes = COALESCE($10, notes)
         WHERE id = $1
           AND status = 'running'
        RETURNING {SYNC_RUN_COLUMNS}
        "#
    )
}

fn bind_record<'q>(
    query: Query<'q, Postgres, PgArguments>,
    record: &'q OpportunityRecord,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(record.title.as_deref())
        .bind(record.description.as_deref())
        .bind(record.solicitation_number.as_deref())
        .bind(record.notice_type.as_deref())
        .bind(record.base_type.as_deref())
        .bind(record.naics_code.as_deref())
        .bind(record.classification_code.as_deref())
        .bind(record.department.as_deref())
        .bind(record.sub_tier.as_deref())
        .bind(record.office.as_deref())
        .bind(record.full_parent_path.as_deref())
        .bind(record.posted_date)
        .bind(record.response_deadline)
        .bind(record.set_aside_code.as_deref())
        .bind(record.set_aside_description.as_deref())
        .bind(record.active)
        .bind(record.award_amount)
        .bind(record.award_date)
        .bind(record.award_number.as_deref())
        .bind(record.awardee_name.as_deref())
        .bind(record.awardee_uei.as_deref())
        .bind(record.awardee_city.as_deref())
        .bind(record.awardee_state.as_deref())
        .bind(record.ui_link.as_deref())
        .bind(Json(&record.raw_payload))
}

fn row_to_stored(row: &PgRow) -> Result<StoredOpportunity, StoreError> {
    let sync_status: String = row.try_get("sync_status")?;
    let raw_payload: Json<serde_json::Value> = row.try_get("raw_payload")?;
    Ok(StoredOpportunity {
        id: row.try_get("id")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        sync_status: sync_status
            .parse::<RecordSyncStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        last_synced_at: row.try_get("last_synced_at")?,
        sync_error: row.try_get("sync_error")?,
        record: OpportunityRecord {
            opportunity_id: row.try_get("opportunity_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            solicitation_number: row.try_get("solicitation_number")?,
            notice_type: row.try_get("notice_type")?,
            base_type: row.try_get("base_type")?,
            naics_code: row.try_get("naics_code")?,
            classification_code: row.try_get("classification_code")?,
            department: row.try_get("department")?,
            sub_tier: row.try_get("sub_tier")?,
            office: row.try_get("office")?,
            full_parent_path: row.try_get("full_parent_path")?,
            posted_date: row.try_get("posted_date")?,
            response_deadline: row.try_get("response_deadline")?,
            set_aside_code: row.try_get("set_aside_code")?,
            set_aside_description: row.try_get("set_aside_description")?,
            active: row.try_get("active")?,
            award_amount: row.try_get("award_amount")?,
            award_date: row.try_get("award_date")?,
            award_number: row.try_get("award_number")?,
            awardee_name: row.try_get("awardee_name")?,
            awardee_uei: row.try_get("awardee_uei")?,
            awardee_city: row.try_get("awardee_city")?,
            awardee_state: row.try_get("awardee_state")?,
            ui_link: row.try_get("ui_link")?,
            raw_payload: raw_payload.0,
        },
    })
}

fn counter_from_row(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    Ok(value.max(0) as u64)
}

fn row_to_sync_run(row: &PgRow) -> Result<SyncRun, StoreError> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    let errors: Json<Vec<SyncErrorEntry>> = row.try_get("errors")?;
    let params: Json<serde_json::Value> = row.try_get("params")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        sync_type: sync_type
            .parse::<SyncType>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        status: status
            .parse::<SyncRunStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        counters: SyncCounters {
            processed: counter_from_row(row, "processed")?,
            created: counter_from_row(row, "created")?,
            updated: counter_from_row(row, "updated")?,
            failed: counter_from_row(row, "failed")?,
        },
        errors: errors.0,
        params: params.0,
        notes: row.try_get("notes")?,
    })
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn find_by_natural_key(
        &self,
        opportunity_id: &str,
    ) -> Result<Option<StoredOpportunity>, StoreError> {
        let sql = format!(
            "SELECT {} FROM opportunities WHERE opportunity_id = $1",
            opportunity_select_columns()
        );
        let row = sqlx::query(&sql)
            .bind(opportunity_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn create(
        &self,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError> {
        let sql = insert_opportunity_sql();
        let query = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(record.opportunity_id.as_str())
            .bind(synced_at);
        let row = bind_record(query, record).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => row_to_stored(&row),
            None => Err(StoreError::AlreadyExists(record.opportunity_id.clone())),
        }
    }

    async fn update(
        &self,
        opportunity_id: &str,
        expected_version: i64,
        record: &OpportunityRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<StoredOpportunity, StoreError> {
        let sql = update_opportunity_sql();
        let query = sqlx::query(&sql).bind(opportunity_id).bind(expected_version);
        let row = bind_record(query, record)
            .bind(synced_at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => row_to_stored(&row),
            None if self.opportunity_exists(opportunity_id).await? => Err(StoreError::VersionConflict {
                opportunity_id: opportunity_id.to_string(),
                expected: expected_version,
            }),
            None => Err(StoreError::NotFound(opportunity_id.to_string())),
        }
    }

    async fn mark_error(
        &self,
        opportunity_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(MARK_OPPORTUNITY_ERROR_SQL)
            .bind(opportunity_id)
            .bind(message)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(opportunity_id.to_string()));
        }
        Ok(())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM opportunities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl SyncRunStore for PgStore {
    async fn create(&self, run: &SyncRun) -> Result<(), StoreError> {
        let c = run.counters;
        sqlx::query(
            r#"
            INSERT INTO sync_runs
                (id, sync_type, status, started_at, finished_at, duration_ms,
                 processed, created, updated, failed, errors, params, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(run.sync_type.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.duration_ms)
        .bind(c.processed as i64)
        .bind(c.created as i64)
        .bind(c.updated as i64)
        .bind(c.failed as i64)
        .bind(Json(&run.errors))
        .bind(Json(&run.params))
        .bind(run.notes.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, id: Uuid, update: &SyncRunUpdate) -> Result<SyncRun, StoreError> {
        let counters = update.counters;
        let sql = update_run_sql();
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.finished_at)
            .bind(update.duration_ms)
            .bind(counters.map(|c| c.processed as i64))
            .bind(counters.map(|c| c.created as i64))
            .bind(counters.map(|c| c.updated as i64))
            .bind(counters.map(|c| c.failed as i64))
            .bind(update.errors.as_ref().map(Json))
            .bind(update.notes.as_deref())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_sync_run(&row),
            None => match self.get_by_id(id).await? {
                Some(_) => Err(StoreError::RunFinalized(id)),
                None => Err(StoreError::NotFound(id.to_string())),
            },
        }
    }

    async fn get_recent(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let sql = format!("SELECT {SYNC_RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_sync_run).collect()
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<SyncRun>, StoreError> {
        let sql = format!("SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_sync_run).transpose()
    }
}
