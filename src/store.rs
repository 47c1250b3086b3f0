//! Shared key-value store abstraction: the only cross-process mutable state.
//!
//! Every mutation is a single-key atomic command. Backends never offer
//! multi-key transactions, so callers must not rely on them.

pub mod keys;
pub mod memory;
pub mod redis;

use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;

pub use keys::StoreKeys;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused, dropped, or otherwise unreachable.
    Unavailable { reason: String },
    Timeout { operation: &'static str },
    /// The store answered but the command failed.
    Command {
        operation: &'static str,
        reason: String,
    },
}

impl StoreError {
    /// Infrastructure flakiness, as opposed to a failing command.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. } | StoreError::Timeout { .. }
        )
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable { reason } => write!(f, "store unavailable: {reason}"),
            StoreError::Timeout { operation } => write!(f, "store {operation} timed out"),
            StoreError::Command { operation, reason } => {
                write!(f, "store {operation} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

pub trait KeyValueStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<String>>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    /// Adds `member` to the sorted set at `key` with `score`.
    fn zadd<'a>(&'a self, key: &'a str, member: &'a str, score: u64)
        -> BoxFuture<'a, StoreResult<()>>;

    /// Members with `min <= score <= max`, ordered by score then member.
    fn zrange_by_score<'a>(
        &'a self,
        key: &'a str,
        min: u64,
        max: u64,
    ) -> BoxFuture<'a, StoreResult<Vec<String>>>;

    /// Removes members with `min <= score <= max`, returning how many went.
    fn zrem_range_by_score<'a>(
        &'a self,
        key: &'a str,
        min: u64,
        max: u64,
    ) -> BoxFuture<'a, StoreResult<u64>>;

    /// Atomically adds `amount` to the counter at `key`. When the increment
    /// creates the counter, its expiry is set to `expiry` in the same step.
    fn incr_with_expiry<'a>(
        &'a self,
        key: &'a str,
        amount: u64,
        expiry: Duration,
    ) -> BoxFuture<'a, StoreResult<u64>>;

    /// Remaining time to live; `None` when the key is missing or persistent.
    fn ttl<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Duration>>>;

    /// Deletes every key matching the glob `pattern`, issuing deletes in
    /// batches of at most `batch_size` keys.
    fn delete_matching<'a>(
        &'a self,
        pattern: &'a str,
        batch_size: usize,
    ) -> BoxFuture<'a, StoreResult<u64>>;
}
