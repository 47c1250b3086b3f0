use super::limits::RateLimit;
use crate::runtime::telemetry::Telemetry;
use crate::store::{KeyValueStore, StoreError, StoreKeys};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Keys deleted per `DEL` when clearing buckets.
pub const CLEAR_BATCH_SIZE: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// The identity used up `limit` for the current window.
    Exceeded {
        identity: String,
        limit: RateLimit,
        retry_after: Duration,
        context: String,
    },
    /// The store rejected a command; admission is denied.
    Store(StoreError),
}

impl RateLimitError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitError::Exceeded { retry_after, .. } => Some(*retry_after),
            RateLimitError::Store(_) => None,
        }
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::Exceeded {
                identity,
                limit,
                retry_after,
                context,
            } => write!(
                f,
                "rate limit {limit} exceeded for {identity} ({context}); retry after {}ms",
                retry_after.as_millis()
            ),
            RateLimitError::Store(err) => write!(f, "rate limiter store error: {err}"),
        }
    }
}

impl std::error::Error for RateLimitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RateLimitError::Store(err) => Some(err),
            RateLimitError::Exceeded { .. } => None,
        }
    }
}

/// Usage of one limit's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub remaining: u64,
    pub reset_in: Duration,
}

/// Fixed-window limiter. Each `(identity, limit)` pair owns one counter that
/// is created with the window as its expiry and disappears when it lapses.
///
/// Transient store failures (unreachable, timeout) admit the call; any other
/// store failure denies it.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
    limits: Vec<RateLimit>,
    telemetry: Option<Arc<Telemetry>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StoreKeys, limits: Vec<RateLimit>) -> Self {
        Self {
            store,
            keys,
            limits,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn limits(&self) -> &[RateLimit] {
        &self.limits
    }

    fn bucket_key(&self, identity: &str, limit: &RateLimit) -> String {
        self.keys.rate_limit_bucket(identity, &limit.key_fragment())
    }

    /// Charges `cost` against every configured limit, in order. The first
    /// limit whose window count goes over its amount fails the call; charges
    /// already made against earlier limits stand.
    pub async fn try_acquire(
        &self,
        identity: &str,
        cost: u64,
        context: &str,
    ) -> Result<(), RateLimitError> {
        for limit in &self.limits {
            let key = self.bucket_key(identity, limit);
            let window = limit.window();

            let count = match self.store.incr_with_expiry(&key, cost, window).await {
                Ok(count) => count,
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        identity,
                        limit = %limit,
                        error = %err,
                        "rate limiter store unreachable; admitting call"
                    );
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.record_rate_limit_fail_open();
                    }
                    return Ok(());
                }
                Err(err) => return Err(RateLimitError::Store(err)),
            };

            if count > limit.amount {
                let retry_after = match self.store.ttl(&key).await {
                    Ok(Some(ttl)) => ttl.min(window),
                    Ok(None) | Err(_) => window,
                };
                tracing::debug!(
                    identity,
                    limit = %limit,
                    count,
                    retry_after_ms = retry_after.as_millis() as u64,
                    context,
                    "rate limit exceeded"
                );
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_rate_limit_rejection();
                }
                return Err(RateLimitError::Exceeded {
                    identity: identity.to_owned(),
                    limit: *limit,
                    retry_after,
                    context: context.to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Deletes every bucket whose key, relative to the limiter namespace,
    /// matches the glob `pattern` (`"*"` clears everything).
    pub async fn clear_all(&self, pattern: &str) -> Result<u64, StoreError> {
        let full = format!("{}{pattern}", self.keys.rate_limit_prefix());
        let removed = self.store.delete_matching(&full, CLEAR_BATCH_SIZE).await?;
        tracing::info!(pattern = %full, removed, "cleared rate limit buckets");
        Ok(removed)
    }

    pub async fn window_stats(
        &self,
        identity: &str,
        limit: &RateLimit,
    ) -> Result<WindowStats, StoreError> {
        let key = self.bucket_key(identity, limit);
        let used = match self.store.get(&key).await? {
            Some(raw) => raw.parse::<u64>().unwrap_or(0),
            None => 0,
        };
        let reset_in = self.store.ttl(&key).await?.unwrap_or(Duration::ZERO);
        Ok(WindowStats {
            remaining: limit.amount.saturating_sub(used),
            reset_in,
        })
    }
}
