//! Sync pipeline: bulk fetch from the upstream search API, batched
//! reconciliation into the opportunity store, and the cron scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use oppsync_adapters::OpportunitySearchClient;
use oppsync_storage::{OpportunityStore, SyncRunStore};

pub mod config;
pub mod fetch;
pub mod pipeline;
pub mod schedule;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use fetch::BulkFetcher;
pub use pipeline::{
    dedupe_by_natural_key, OrchestratorConfig, ReconcileError, Reconciled, SyncError,
    SyncOrchestrator,
};
pub use schedule::{
    build_scheduler, load_schedules, lookback_window, parse_schedules, ScheduledSync, SyncSchedule,
};

pub const CRATE_NAME: &str = "oppsync-sync";

/// Wires the live upstream client into an orchestrator over the given stores.
pub fn build_orchestrator(
    config: &SyncConfig,
    opportunities: Arc<dyn OpportunityStore>,
    runs: Arc<dyn SyncRunStore>,
) -> Result<SyncOrchestrator> {
    let client = OpportunitySearchClient::new(config.client_config())
        .context("building upstream search client (set SAM_API_KEYS or SAM_API_KEY)")?;
    let fetcher = BulkFetcher::new(Arc::new(client), config.page_size, config.page_delay());
    Ok(SyncOrchestrator::new(
        fetcher,
        opportunities,
        runs,
        config.orchestrator_config(),
    ))
}
