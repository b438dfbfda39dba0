//! Request-budget and retry primitives shared by upstream clients.

use std::collections::VecDeque;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx, 1xx and 429 are transient; every other non-success status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status.is_informational()
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    WaitUntil(Instant),
}

/// Sliding log of grant instants. Admits at most `max_requests` grants in any
/// window of length `window`, so the budget holds for rolling windows and not
/// only for aligned ones.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    max_requests: u32,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_requests = config.max_requests.max(1);
        Self {
            max_requests,
            window: config.window,
            grants: VecDeque::with_capacity(max_requests as usize),
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(oldest) = self.grants.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> Acquire {
        self.evict_expired(now);
        if (self.grants.len() as u32) < self.max_requests {
            self.grants.push_back(now);
            return Acquire::Granted;
        }
        match self.reset_at() {
            Some(at) => Acquire::WaitUntil(at),
            None => Acquire::Granted,
        }
    }

    /// Instant at which the oldest grant leaves the window.
    pub fn reset_at(&self) -> Option<Instant> {
        self.grants.front().map(|oldest| *oldest + self.window)
    }
}

/// Per-credential request budget. Waiting never fails the caller; it only delays.
#[derive(Debug)]
pub struct RateLimitBucket {
    state: Mutex<SlidingWindow>,
}

impl RateLimitBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(SlidingWindow::new(config)),
        }
    }

    /// Takes one token, sleeping until the window resets when the bucket is
    /// empty. Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            let mut state = self.state.lock().await;
            match state.try_acquire(Instant::now()) {
                Acquire::Granted => return started.elapsed(),
                Acquire::WaitUntil(reset_at) => {
                    drop(state);
                    debug!(
                        wait_ms = reset_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "rate-limit bucket empty; waiting for window reset"
                    );
                    tokio::time::sleep_until(reset_at).await;
                }
            }
        }
    }
}
