//! Where the detector learns the chain's current epoch.

use crate::messages::{Epoch, EpochAuthorityReport, MessageError};
use crate::ratelimit::{RateLimitError, RateLimiter};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;

/// Rate-limit identity charged for each request to the epoch authority.
pub const EPOCH_AUTHORITY_IDENTITY: &str = "epochAuthority";

#[derive(Debug)]
pub enum EpochSourceError {
    Request(String),
    Status(u16),
    Decode(String),
    Invalid(MessageError),
    RateLimited(RateLimitError),
}

impl fmt::Display for EpochSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochSourceError::Request(reason) => write!(f, "epoch authority request failed: {reason}"),
            EpochSourceError::Status(code) => write!(f, "epoch authority returned HTTP {code}"),
            EpochSourceError::Decode(reason) => {
                write!(f, "epoch authority response undecodable: {reason}")
            }
            EpochSourceError::Invalid(err) => write!(f, "epoch authority reported {err}"),
            EpochSourceError::RateLimited(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EpochSourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EpochSourceError::Invalid(err) => Some(err),
            EpochSourceError::RateLimited(err) => Some(err),
            _ => None,
        }
    }
}

pub trait EpochSource: Send + Sync {
    /// The epoch the chain is currently in.
    fn current_epoch(&self) -> BoxFuture<'_, Result<Epoch, EpochSourceError>>;
}

/// Polls an HTTP endpoint answering `{epochStartBlockHeight, epochEndBlockHeight}`.
pub struct HttpEpochSource {
    client: reqwest::Client,
    url: String,
    limiter: Option<RateLimiter>,
}

impl HttpEpochSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build epoch authority http client")?;
        Ok(Self {
            client,
            url: url.into(),
            limiter: None,
        })
    }

    /// Charges every request against `limiter` before it is sent.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Epoch, EpochSourceError> {
        if let Some(limiter) = &self.limiter {
            limiter
                .try_acquire(EPOCH_AUTHORITY_IDENTITY, 1, &self.url)
                .await
                .map_err(EpochSourceError::RateLimited)?;
        }

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| EpochSourceError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EpochSourceError::Status(status.as_u16()));
        }

        let report: EpochAuthorityReport = response
            .json()
            .await
            .map_err(|err| EpochSourceError::Decode(err.to_string()))?;

        report.into_epoch().map_err(EpochSourceError::Invalid)
    }
}

impl EpochSource for HttpEpochSource {
    fn current_epoch(&self) -> BoxFuture<'_, Result<Epoch, EpochSourceError>> {
        Box::pin(self.fetch())
    }
}
