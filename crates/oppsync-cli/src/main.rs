use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use oppsync_core::{SyncParams, SyncResult, SyncType};
use oppsync_storage::{
    MemoryOpportunityStore, MemorySyncRunStore, OpportunityStore, PgStore, SyncRunStore,
};
use oppsync_sync::{build_orchestrator, build_scheduler, load_schedules, lookback_window, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "oppsync")]
#[command(about = "Contract opportunity sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and reconcile one posted-date window.
    Sync {
        /// Start of the window (YYYY-MM-DD). Defaults to today minus the lookback.
        #[arg(long)]
        from: Option<String>,
        /// End of the window (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        to: Option<String>,
        /// Category (NAICS) code; repeatable.
        #[arg(long = "naics")]
        naics: Vec<String>,
        /// Notice type code; repeatable.
        #[arg(long = "ptype")]
        ptype: Vec<String>,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// List recent sync runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one sync run as JSON.
    Run { id: Uuid },
    Migrate,
    Serve,
    /// Run the cron scheduler in the foreground.
    Schedule,
}

type Stores = (Arc<dyn OpportunityStore>, Arc<dyn SyncRunStore>);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync {
        from: None,
        to: None,
        naics: Vec::new(),
        ptype: Vec::new(),
        department: None,
        dry_run: false,
    });

    match command {
        Commands::Sync {
            from,
            to,
            naics,
            ptype,
            department,
            dry_run,
        } => {
            let (default_from, default_to) =
                lookback_window(Utc::now().date_naive(), config.lookback_days);
            let params = SyncParams {
                posted_from: from.unwrap_or(default_from),
                posted_to: to.unwrap_or(default_to),
                naics_codes: if naics.is_empty() {
                    config.naics_codes.clone()
                } else {
                    naics
                },
                notice_types: ptype,
                department,
                dry_run,
                sync_type: SyncType::Cli,
            };

            let (opportunities, runs) = open_stores(&config).await?;
            let orchestrator = build_orchestrator(&config, opportunities, runs)?;
            let result = orchestrator.run_sync(params).await?;
            print_result(&result);
            if !result.success {
                bail!("sync run {} finished with failures", result.run_id);
            }
        }
        Commands::Runs { limit } => {
            let (_, runs) = open_stores(&config).await?;
            for run in runs.get_recent(limit).await? {
                println!(
                    "{} {:<9} {:<9} started={} processed={} created={} updated={} failed={}",
                    run.id,
                    run.status.as_str(),
                    run.sync_type.as_str(),
                    run.started_at.to_rfc3339(),
                    run.counters.processed,
                    run.counters.created,
                    run.counters.updated,
                    run.counters.failed
                );
            }
        }
        Commands::Run { id } => {
            let (_, runs) = open_stores(&config).await?;
            match runs.get_by_id(id).await? {
                Some(run) => println!("{}", serde_json::to_string_pretty(&run)?),
                None => bail!("sync run {id} not found"),
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            PgStore::connect(url).await?.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let (opportunities, runs) = open_stores(&config).await?;
            let orchestrator = Arc::new(build_orchestrator(&config, opportunities, runs)?);

            let scheduler = if config.scheduler_enabled {
                let schedules = load_schedules(&config).await?;
                let sched = build_scheduler(orchestrator.clone(), &schedules).await?;
                sched.start().await.context("starting scheduler")?;
                Some(sched)
            } else {
                None
            };

            oppsync_web::serve(oppsync_web::AppState::new(orchestrator), config.web_port).await?;

            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule => {
            let (opportunities, runs) = open_stores(&config).await?;
            let orchestrator = Arc::new(build_orchestrator(&config, opportunities, runs)?);
            let schedules = load_schedules(&config).await?;
            let mut sched = build_scheduler(orchestrator, &schedules).await?;
            sched.start().await.context("starting scheduler")?;
            info!(jobs = schedules.len(), "scheduler running; ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,oppsync=debug"));
    let json = std::env::var("OPPSYNC_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn open_stores(config: &SyncConfig) -> Result<Stores> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = Arc::new(PgStore::connect(url).await?);
            let opportunities: Arc<dyn OpportunityStore> = store.clone();
            let runs: Arc<dyn SyncRunStore> = store;
            Ok((opportunities, runs))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory stores, nothing will persist");
            let opportunities: Arc<dyn OpportunityStore> = Arc::new(MemoryOpportunityStore::new());
            let runs: Arc<dyn SyncRunStore> = Arc::new(MemorySyncRunStore::new());
            Ok((opportunities, runs))
        }
    }
}

fn print_result(result: &SyncResult) {
    println!(
        "sync {}: run_id={} processed={} created={} updated={} failed={} duration_ms={}",
        result.status.as_str(),
        result.run_id,
        result.processed,
        result.created,
        result.updated,
        result.failed,
        result.duration_ms
    );
    for entry in &result.errors {
        println!(
            "  [{:?}] {}{}",
            entry.scope,
            entry
                .opportunity_id
                .as_deref()
                .map(|id| format!("{id}: "))
                .unwrap_or_default(),
            entry.message
        );
    }
}
