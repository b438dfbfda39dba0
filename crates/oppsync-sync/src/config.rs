use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use oppsync_adapters::ClientConfig;
use oppsync_storage::{BackoffPolicy, RateLimitConfig};

use crate::pipeline::OrchestratorConfig;

pub const DEFAULT_API_BASE_URL: &str = "https://api.sam.gov";
const SEARCH_PATH: &str = "/opportunities/v2/search";
/// Largest `limit` the upstream search accepts.
pub const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub api_base_url: String,
    pub api_keys: Vec<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub page_size: u32,
    pub page_delay_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub lookback_days: i64,
    pub naics_codes: Vec<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub schedule_file: Option<PathBuf>,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvLookup(lookup);

        let api_keys = env
            .get("SAM_API_KEYS")
            .or_else(|| env.get("SAM_API_KEY"))
            .map(|v| split_list(&v))
            .unwrap_or_default();

        Self {
            database_url: env.get("DATABASE_URL"),
            api_base_url: env.get("SAM_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            api_keys,
            http_timeout_secs: env.parsed("SAM_HTTP_TIMEOUT_SECS").unwrap_or(30),
            user_agent: env.get("OPPSYNC_USER_AGENT").unwrap_or_else(|| "oppsync/0.1".to_string()),
            max_retries: env.parsed("SAM_MAX_RETRIES").unwrap_or(3),
            backoff_base_ms: env.parsed("SAM_BACKOFF_BASE_MS").unwrap_or(500),
            backoff_max_ms: env.parsed("SAM_BACKOFF_MAX_MS").unwrap_or(30_000),
            rate_limit_requests: env.parsed("SAM_RATE_LIMIT_REQUESTS").unwrap_or(10),
            rate_limit_window_secs: env.parsed("SAM_RATE_LIMIT_WINDOW_SECS").unwrap_or(1),
            page_size: env
                .parsed::<u32>("SYNC_PAGE_SIZE")
                .unwrap_or(100)
                .clamp(1, MAX_PAGE_SIZE),
            page_delay_ms: env.parsed("SYNC_PAGE_DELAY_MS").unwrap_or(250),
            batch_size: env.parsed("SYNC_BATCH_SIZE").unwrap_or(50),
            batch_delay_ms: env.parsed("SYNC_BATCH_DELAY_MS").unwrap_or(100),
            lookback_days: env.parsed("SYNC_LOOKBACK_DAYS").unwrap_or(7),
            naics_codes: env.get("SYNC_NAICS_CODES").map(|v| split_list(&v)).unwrap_or_default(),
            scheduler_enabled: env.get("OPPSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: env.get("SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            schedule_file: env.get("SYNC_SCHEDULE_FILE").map(PathBuf::from),
            web_port: env.parsed("OPPSYNC_WEB_PORT").unwrap_or(8080),
        }
    }

    pub fn search_url(&self) -> String {
        format!("{}{SEARCH_PATH}", self.api_base_url.trim_end_matches('/'))
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            search_url: self.search_url(),
            api_keys: self.api_keys.clone(),
            rate_limit: RateLimitConfig {
                max_requests: self.rate_limit_requests.max(1),
                window: Duration::from_secs(self.rate_limit_window_secs.max(1)),
            },
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            batch_size: self.batch_size.max(1),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            ..OrchestratorConfig::default()
        }
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

/// Key lookup where blank values count as unset.
struct EnvLookup<F>(F);

impl<F> EnvLookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| parse_or_ignore(key, &v))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or_ignore<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparsable config value");
            None
        }
    }
}
