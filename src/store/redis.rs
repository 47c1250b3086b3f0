//! Redis-backed store. All commands go through a shared `ConnectionManager`
//! (reconnecting, multiplexed) and are bounded by a per-operation timeout.

use super::{KeyValueStore, StoreError, StoreResult};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Increments KEYS[1] by ARGV[1]; if that created the counter, sets its expiry
/// to ARGV[2] milliseconds inside the same script so no counter is left
/// without a TTL.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
local current = redis.call("INCRBY", KEYS[1], ARGV[1])
if tonumber(current) == tonumber(ARGV[1]) then
    redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return current
"#;

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    operation_timeout: Duration,
    incr_with_expiry: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_timeout(url, DEFAULT_OPERATION_TIMEOUT).await
    }

    pub async fn connect_with_timeout(url: &str, operation_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self {
            connection,
            operation_timeout,
            incr_with_expiry: Script::new(INCR_WITH_EXPIRY_SCRIPT),
        })
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, command: F) -> StoreResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        match timeout(self.operation_timeout, command(self.connection.clone())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(operation, err)),
            Err(_) => Err(StoreError::Timeout { operation }),
        }
    }
}

fn classify(operation: &'static str, err: RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout { operation }
    } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
        StoreError::Unavailable {
            reason: err.to_string(),
        }
    } else {
        StoreError::Command {
            operation,
            reason: err.to_string(),
        }
    }
}

impl KeyValueStore for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<String>>> {
        Box::pin(self.run("get", move |mut conn| async move {
            let value: Option<String> = conn.get(key).await?;
            Ok::<_, RedisError>(value)
        }))
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(self.run("set", move |mut conn| async move {
            let _: () = conn.set(key, value).await?;
            Ok::<_, RedisError>(())
        }))
    }

    fn zadd<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: u64,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(self.run("zadd", move |mut conn| async move {
            let _: () = conn.zadd(key, member, score).await?;
            Ok::<_, RedisError>(())
        }))
    }

    fn zrange_by_score<'a>(
        &'a self,
        key: &'a str,
        min: u64,
        max: u64,
    ) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(self.run("zrangebyscore", move |mut conn| async move {
            let members: Vec<String> = conn.zrangebyscore(key, min, max).await?;
            Ok::<_, RedisError>(members)
        }))
    }

    fn zrem_range_by_score<'a>(
        &'a self,
        key: &'a str,
        min: u64,
        max: u64,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(self.run("zremrangebyscore", move |mut conn| async move {
            let removed: u64 = conn.zrembyscore(key, min, max).await?;
            Ok::<_, RedisError>(removed)
        }))
    }

    fn incr_with_expiry<'a>(
        &'a self,
        key: &'a str,
        amount: u64,
        expiry: Duration,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        let expiry_ms = expiry.as_millis().clamp(1, u128::from(u64::MAX)) as u64;
        Box::pin(self.run("incr_with_expiry", move |mut conn| async move {
            let current: u64 = self
                .incr_with_expiry
                .key(key)
                .arg(amount)
                .arg(expiry_ms)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, RedisError>(current)
        }))
    }

    fn ttl<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Duration>>> {
        Box::pin(self.run("pttl", move |mut conn| async move {
            let millis: i64 = conn.pttl(key).await?;
            // -2 means missing, -1 means no expiry.
            Ok::<_, RedisError>((millis >= 0).then(|| Duration::from_millis(millis as u64)))
        }))
    }

    fn delete_matching<'a>(
        &'a self,
        pattern: &'a str,
        batch_size: usize,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        let batch_size = batch_size.max(1);
        Box::pin(async move {
            let removed = delete_paged(
                |cursor| {
                    self.run("scan", move |mut conn| async move {
                        let page: (u64, Vec<String>) = scan_page(cursor, pattern, batch_size)
                            .query_async(&mut conn)
                            .await?;
                        Ok::<_, RedisError>(page)
                    })
                },
                |keys| {
                    self.run("del", move |mut conn| async move {
                        let deleted: u64 = conn.del(keys).await?;
                        Ok::<_, RedisError>(deleted)
                    })
                },
            )
            .await?;
            tracing::debug!(pattern, removed, "deleted keys matching pattern");
            Ok(removed)
        })
    }
}

/// One `SCAN` step: at most about `count` keys matching `pattern` from `cursor`.
fn scan_page(cursor: u64, pattern: &str, count: usize) -> redis::Cmd {
    let mut cmd = redis::cmd("SCAN");
    cmd.arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(count);
    cmd
}

/// Walks a scan cursor until it returns to zero, deleting each non-empty page
/// before fetching the next one. Each step is its own command.
async fn delete_paged<S, SFut, D, DFut>(mut scan: S, mut delete: D) -> StoreResult<u64>
where
    S: FnMut(u64) -> SFut,
    SFut: Future<Output = StoreResult<(u64, Vec<String>)>>,
    D: FnMut(Vec<String>) -> DFut,
    DFut: Future<Output = StoreResult<u64>>,
{
    let mut cursor = 0u64;
    let mut removed = 0u64;
    loop {
        let (next, keys) = scan(cursor).await?;
        if !keys.is_empty() {
            removed += delete(keys).await?;
        }
        if next == 0 {
            return Ok(removed);
        }
        cursor = next;
    }
}
