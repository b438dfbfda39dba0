use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use oppsync_core::{SyncParams, SyncResult, SyncType};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::pipeline::SyncOrchestrator;

fn default_lookback_days() -> i64 {
    7
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchedule {
    pub name: String,
    pub cron: String,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub notice_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleFile {
    schedules: Vec<SyncSchedule>,
}

impl SyncSchedule {
    pub fn params_for(&self, today: NaiveDate) -> SyncParams {
        let (posted_from, posted_to) = lookback_window(today, self.lookback_days);
        SyncParams {
            naics_codes: self.naics_codes.clone(),
            notice_types: self.notice_types.clone(),
            sync_type: SyncType::Scheduled,
            ..SyncParams::new(posted_from, posted_to)
        }
    }
}

/// `[today - days, today]` as ISO dates.
pub fn lookback_window(today: NaiveDate, days: i64) -> (String, String) {
    let from = today - ChronoDuration::days(days.max(0));
    (
        from.format("%Y-%m-%d").to_string(),
        today.format("%Y-%m-%d").to_string(),
    )
}

pub fn parse_schedules(yaml: &str) -> Result<Vec<SyncSchedule>> {
    let file: ScheduleFile = serde_yaml::from_str(yaml).context("parsing schedule yaml")?;
    Ok(file.schedules)
}

/// Schedules from `SYNC_SCHEDULE_FILE` when set, otherwise one job built from
/// `SYNC_CRON` and the configured lookback and categories.
pub async fn load_schedules(config: &SyncConfig) -> Result<Vec<SyncSchedule>> {
    match &config.schedule_file {
        Some(path) => read_schedule_file(path).await,
        None => Ok(vec![SyncSchedule {
            name: "default".to_string(),
            cron: config.sync_cron.clone(),
            lookback_days: config.lookback_days,
            naics_codes: config.naics_codes.clone(),
            notice_types: Vec::new(),
        }]),
    }
}

async fn read_schedule_file(path: &Path) -> Result<Vec<SyncSchedule>> {
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_schedules(&raw).with_context(|| format!("loading schedules from {}", path.display()))
}

/// One scheduled job. Overlapping ticks of the same job are skipped.
pub struct ScheduledSync {
    schedule: SyncSchedule,
    orchestrator: Arc<SyncOrchestrator>,
    in_flight: AtomicBool,
}

impl ScheduledSync {
    pub fn new(schedule: SyncSchedule, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            schedule,
            orchestrator,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns `None` when the tick was skipped or the run could not start.
    pub async fn tick(&self, today: NaiveDate) -> Option<SyncResult> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!(job = %self.schedule.name, "previous run still in flight; skipping tick");
            return None;
        }

        let params = self.schedule.params_for(today);
        info!(job = %self.schedule.name, from = %params.posted_from, to = %params.posted_to, "scheduled sync starting");
        let outcome = self.orchestrator.run_sync(params).await;
        self.in_flight.store(false, Ordering::SeqCst);

        match outcome {
            Ok(result) => Some(result),
            Err(err) => {
                error!(job = %self.schedule.name, error = %err, "scheduled sync could not start");
                None
            }
        }
    }
}

pub async fn build_scheduler(
    orchestrator: Arc<SyncOrchestrator>,
    schedules: &[SyncSchedule],
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for schedule in schedules {
        let job_state = Arc::new(ScheduledSync::new(schedule.clone(), orchestrator.clone()));
        let job = Job::new_async(schedule.cron.as_str(), move |_uuid, _l| {
            let job_state = job_state.clone();
            Box::pin(async move {
                job_state.tick(Utc::now().date_naive()).await;
            })
        })
        .with_context(|| format!("creating scheduler job {} for cron {}", schedule.name, schedule.cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(job = %schedule.name, cron = %schedule.cron, "scheduled sync registered");
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BulkFetcher;
    use crate::pipeline::OrchestratorConfig;
    use crate::testing::{records, FakeSearchApi};
    use oppsync_storage::{MemoryOpportunityStore, MemorySyncRunStore};
    use std::time::Duration;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn yaml_schedules_fill_defaults() {
        let schedules = parse_schedules(
            r#"
schedules:
  - name: morning
    cron: "0 0 6 * * *"
    naics_codes: ["541512"]
  - name: weekly
    cron: "0 0 3 * * Sun"
    lookback_days: 30
    notice_types: [o, k]
"#,
        )
        .unwrap();

        assert_eq!(schedules.len(), 2);
        assert_eq!(schedules[0].lookback_days, 7);
        assert_eq!(schedules[0].naics_codes, vec!["541512"]);
        assert_eq!(schedules[1].lookback_days, 30);
        assert_eq!(schedules[1].notice_types, vec!["o", "k"]);
    }

    #[test]
    fn params_cover_lookback_window() {
        let schedule = SyncSchedule {
            name: "morning".into(),
            cron: "0 0 6 * * *".into(),
            lookback_days: 15,
            naics_codes: vec!["541512".into()],
            notice_types: Vec::new(),
        };
        let params = schedule.params_for(date("2025-06-16"));
        assert_eq!(params.posted_from, "2025-06-01");
        assert_eq!(params.posted_to, "2025-06-16");
        assert_eq!(params.sync_type, SyncType::Scheduled);
        assert!(!params.dry_run);
    }

    #[tokio::test]
    async fn default_schedule_comes_from_config() {
        let config = SyncConfig::from_lookup(|key| match key {
            "SYNC_CRON" => Some("0 30 5 * * *".to_string()),
            "SYNC_NAICS_CODES" => Some("236220".to_string()),
            _ => None,
        });
        let schedules = load_schedules(&config).await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].cron, "0 30 5 * * *");
        assert_eq!(schedules[0].naics_codes, vec!["236220"]);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let runs = Arc::new(MemorySyncRunStore::new());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            BulkFetcher::new(
                Arc::new(FakeSearchApi::new().with_records(None, records("opp", 2))),
                10,
                Duration::ZERO,
            ),
            Arc::new(MemoryOpportunityStore::new()),
            runs.clone(),
            OrchestratorConfig::default(),
        ));
        let job = ScheduledSync::new(
            SyncSchedule {
                name: "test".into(),
                cron: "0 0 6 * * *".into(),
                lookback_days: 1,
                naics_codes: Vec::new(),
                notice_types: Vec::new(),
            },
            orchestrator,
        );

        job.in_flight.store(true, Ordering::SeqCst);
        assert!(job.tick(date("2025-06-16")).await.is_none());

        job.in_flight.store(false, Ordering::SeqCst);
        let result = job.tick(date("2025-06-16")).await.unwrap();
        assert!(result.success);
        assert!(!job.is_running());
        let stored = oppsync_storage::SyncRunStore::get_by_id(runs.as_ref(), result.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.sync_type, SyncType::Scheduled);
    }
}
