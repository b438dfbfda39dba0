//! Rate-limited, retrying client for the upstream opportunity search API.
//!
//! [`OpportunitySearchClient`] owns one request budget per API credential and
//! a round-robin rotation index that only moves on HTTP 429. Transient
//! failures (5xx, 1xx, 429, timeouts) go through an explicit retry loop with
//! exponential backoff; everything else is surfaced immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use oppsync_core::OpportunityRecord;
use oppsync_storage::{
    classify_status, BackoffPolicy, RateLimitBucket, RateLimitConfig, RetryDisposition,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod transport;
pub mod wire;

pub use transport::{ReqwestTransport, Transport, TransportError, TransportRequest, TransportResponse};
pub use wire::{format_wire_date, normalize_opportunity, parse_calendar_date, SearchResponse};

pub const CRATE_NAME: &str = "oppsync-adapters";

pub const DEFAULT_SEARCH_URL: &str = "https://api.sam.gov/opportunities/v2/search";

/// Longest slice of an error body kept for diagnostics.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Category (NAICS) code, sent as `ncode`.
    pub naics_code: Option<String>,
    /// Notice type codes, sent comma-joined as `ptype`.
    #[serde(default)]
    pub notice_types: Vec<String>,
    /// Issuing organization name, sent as `organizationName`.
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub posted_from: String,
    pub posted_to: String,
    pub limit: u32,
    pub offset: u64,
    pub filters: SearchFilters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub limit: u64,
    pub offset: u64,
    pub page_number: Option<u64>,
    pub total_pages: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SearchPage {
    pub records: Vec<OpportunityRecord>,
    pub total_count: u64,
    pub page_info: PageInfo,
    /// Non-fatal oddities noticed while building the request.
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid search parameters: {0}")]
    InvalidParams(String),
    #[error("upstream returned {status} after {attempts} attempt(s): {message}")]
    Status {
        status: u16,
        message: String,
        attempts: usize,
    },
    #[error("transport failure after {attempts} attempt(s): {source}")]
    Transport {
        #[source]
        source: TransportError,
        attempts: usize,
    },
    #[error("malformed upstream response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether the failure was of a retryable kind. Callers see these only
    /// after the client's retries ran out.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            ApiError::Transport { source, .. } => source.is_transient(),
            ApiError::InvalidParams(_) | ApiError::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search(&self, params: &SearchParams) -> Result<SearchPage, ApiError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub search_url: String,
    pub api_keys: Vec<String>,
    pub rate_limit: RateLimitConfig,
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            api_keys: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
struct Credential {
    api_key: String,
    bucket: RateLimitBucket,
}

pub struct OpportunitySearchClient<T = ReqwestTransport> {
    transport: T,
    search_url: String,
    credentials: Vec<Credential>,
    active: AtomicUsize,
    backoff: BackoffPolicy,
}

impl OpportunitySearchClient<ReqwestTransport> {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.timeout, config.user_agent.as_deref())?;
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> OpportunitySearchClient<T> {
    pub fn with_transport(config: ClientConfig, transport: T) -> anyhow::Result<Self> {
        let credentials = config
            .api_keys
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|api_key| Credential {
                api_key: api_key.to_string(),
                bucket: RateLimitBucket::new(config.rate_limit),
            })
            .collect::<Vec<_>>();
        if credentials.is_empty() {
            anyhow::bail!("at least one upstream API key is required");
        }

        Ok(Self {
            transport,
            search_url: config.search_url,
            credentials,
            active: AtomicUsize::new(0),
            backoff: config.backoff,
        })
    }

    pub fn active_credential(&self) -> usize {
        self.active.load(Ordering::SeqCst) % self.credentials.len()
    }

    /// Advances the rotation index past `current`. If a concurrent call has
    /// already rotated away from it, that rotation is kept.
    fn rotate_from(&self, current: usize) -> usize {
        let next = (current + 1) % self.credentials.len();
        match self
            .active
            .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => next,
            Err(actual) => actual % self.credentials.len(),
        }
    }

    fn build_query(&self, params: &SearchParams) -> Result<(Vec<(String, String)>, Vec<String>), ApiError> {
        if params.limit == 0 {
            return Err(ApiError::InvalidParams("limit must be greater than zero".into()));
        }
        if let (Some(from), Some(to)) = (
            parse_calendar_date(&params.posted_from),
            parse_calendar_date(&params.posted_to),
        ) {
            if from > to {
                return Err(ApiError::InvalidParams(format!(
                    "postedFrom {from} is after postedTo {to}"
                )));
            }
        }

        let mut warnings = Vec::new();
        let (posted_from, warning) = format_wire_date(&params.posted_from);
        warnings.extend(warning);
        let (posted_to, warning) = format_wire_date(&params.posted_to);
        warnings.extend(warning);
        for warning in &warnings {
            warn!("{warning}");
        }

        let mut query = vec![
            ("postedFrom".to_string(), posted_from),
            ("postedTo".to_string(), posted_to),
            ("limit".to_string(), params.limit.to_string()),
            ("offset".to_string(), params.offset.to_string()),
        ];
        if !params.filters.notice_types.is_empty() {
            query.push(("ptype".to_string(), params.filters.notice_types.join(",")));
        }
        if let Some(code) = &params.filters.naics_code {
            query.push(("ncode".to_string(), code.clone()));
        }
        if let Some(department) = &params.filters.department {
            query.push(("organizationName".to_string(), department.clone()));
        }
        Ok((query, warnings))
    }

    fn decode_page(&self, body: &[u8], params: &SearchParams) -> Result<SearchPage, ApiError> {
        let response: SearchResponse =
            serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        let records = response
            .opportunities_data
            .unwrap_or_default()
            .into_iter()
            .map(normalize_opportunity)
            .collect::<Vec<_>>();
        Ok(SearchPage {
            records,
            total_count: response.total_records,
            page_info: PageInfo {
                limit: response.limit.unwrap_or(params.limit as u64),
                offset: response.offset.unwrap_or(params.offset),
                page_number: response.page_number,
                total_pages: response.total_pages,
            },
            warnings: Vec::new(),
        })
    }

    async fn search_with_retry(&self, params: &SearchParams) -> Result<SearchPage, ApiError> {
        let (query, warnings) = self.build_query(params)?;
        let mut attempt = 0usize;
        let mut requests = 0usize;
        let mut rotations = 0usize;

        loop {
            let index = self.active_credential();
            let credential = &self.credentials[index];
            credential.bucket.acquire().await;

            let mut request_query = Vec::with_capacity(query.len() + 1);
            request_query.push(("api_key".to_string(), credential.api_key.clone()));
            request_query.extend(query.iter().cloned());
            let request = TransportRequest {
                url: self.search_url.clone(),
                query: request_query,
            };

            requests += 1;
            let outcome = self.transport.get(&request).await;
            let failure = match outcome {
                Ok(resp) if resp.status.is_success() => {
                    let mut page = self.decode_page(&resp.body, params)?;
                    page.warnings = warnings;
                    debug!(
                        credential = index,
                        requests,
                        records = page.records.len(),
                        total = page.total_count,
                        "upstream page received"
                    );
                    return Ok(page);
                }
                Ok(resp) => {
                    let status = resp.status;
                    let message = truncate_body(&resp.body);

                    if status == StatusCode::TOO_MANY_REQUESTS
                        && rotations + 1 < self.credentials.len()
                    {
                        rotations += 1;
                        let next = self.rotate_from(index);
                        warn!(
                            from_credential = index,
                            to_credential = next,
                            "upstream rate limited; rotating credential"
                        );
                        continue;
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(ApiError::Status {
                            status: status.as_u16(),
                            message,
                            attempts: requests,
                        });
                    }
                    ApiError::Status {
                        status: status.as_u16(),
                        message,
                        attempts: requests,
                    }
                }
                Err(err) if err.is_transient() => ApiError::Transport {
                    source: err,
                    attempts: requests,
                },
                Err(err) => {
                    return Err(ApiError::Transport {
                        source: err,
                        attempts: requests,
                    })
                }
            };

            if attempt >= self.backoff.max_retries {
                warn!(attempts = requests, error = %failure, "upstream retries exhausted");
                return Err(failure);
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            attempt += 1;
            rotations = 0;
            warn!(
                attempt,
                status = ?failure.status(),
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "transient upstream failure; backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl<T: Transport> SearchApi for OpportunitySearchClient<T> {
    async fn search(&self, params: &SearchParams) -> Result<SearchPage, ApiError> {
        let span = info_span!(
            "upstream_search",
            offset = params.offset,
            limit = params.limit,
            naics = params.filters.naics_code.as_deref().unwrap_or("")
        );
        self.search_with_retry(params).instrument(span).await
    }
}

fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
