//! HTTP transport seam between the search client and the network.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use oppsync_storage::{classify_reqwest_error, RetryDisposition};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl TransportRequest {
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {message}")]
    Other { message: String, retryable: bool },
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) => true,
            TransportError::Other { retryable, .. } => *retryable,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other {
                retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Every request carries the hard `timeout`; exceeding it surfaces as
    /// [`TransportError::Timeout`].
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout);

        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: &TransportRequest) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .get(&request.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&request.query)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}
