//! In-process store backend. Each operation runs under one short-lived mutex
//! section, which gives the same single-key atomicity the Redis backend gets
//! from the server. Expiry uses the tokio clock so paused-time tests work.

use super::{KeyValueStore, StoreError, StoreResult};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Failure injected into every subsequent operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    #[default]
    Healthy,
    Unavailable,
    CommandError,
}

#[derive(Debug)]
struct Counter {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<String, Counter>,
    sorted: HashMap<String, HashMap<String, u64>>,
    fault: FaultMode,
}

impl MemoryInner {
    fn check(&self, operation: &'static str) -> StoreResult<()> {
        match self.fault {
            FaultMode::Healthy => Ok(()),
            FaultMode::Unavailable => Err(StoreError::Unavailable {
                reason: "connection refused".into(),
            }),
            FaultMode::CommandError => Err(StoreError::Command {
                operation,
                reason: "injected failure".into(),
            }),
        }
    }

    fn purge_expired(&mut self, key: &str, now: Instant) {
        let expired = self
            .values
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|deadline| deadline <= now);
        if expired {
            self.values.remove(key);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following operation fail with the given fault.
    pub fn set_fault(&self, fault: FaultMode) {
        self.lock().fault = fault;
    }

    /// Number of members currently stored in the sorted set at `key`.
    pub fn sorted_len(&self, key: &str) -> usize {
        self.lock().sorted.get(key).map(HashMap::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        // A panic while holding the lock cannot leave a half-applied command,
        // so a poisoned guard is still consistent.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_now(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock();
        inner.check("get")?;
        inner.purge_expired(key, Instant::now());
        Ok(inner.values.get(key).map(|entry| entry.value.clone()))
    }

    fn set_now(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check("set")?;
        inner.values.insert(
            key.to_owned(),
            Counter {
                value: value.to_owned(),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn zadd_now(&self, key: &str, member: &str, score: u64) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.check("zadd")?;
        inner
            .sorted
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);
        Ok(())
    }

    fn zrange_now(&self, key: &str, min: u64, max: u64) -> StoreResult<Vec<String>> {
        let inner = self.lock();
        inner.check("zrangebyscore")?;
        let Some(set) = inner.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(u64, &String)> = set
            .iter()
            .filter(|(_, score)| (min..=max).contains(*score))
            .map(|(member, score)| (*score, member))
            .collect();
        members.sort();
        Ok(members
            .into_iter()
            .map(|(_, member)| member.clone())
            .collect())
    }

    fn zrem_now(&self, key: &str, min: u64, max: u64) -> StoreResult<u64> {
        let mut inner = self.lock();
        inner.check("zremrangebyscore")?;
        let Some(set) = inner.sorted.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, score| !(min..=max).contains(&*score));
        let removed = before - set.len();
        if set.is_empty() {
            inner.sorted.remove(key);
        }
        Ok(removed as u64)
    }

    fn incr_now(&self, key: &str, amount: u64, expiry: Duration) -> StoreResult<u64> {
        let mut inner = self.lock();
        inner.check("incr_with_expiry")?;
        let now = Instant::now();
        inner.purge_expired(key, now);
        let entry = inner.values.entry(key.to_owned()).or_insert(Counter {
            value: "0".into(),
            expires_at: None,
        });
        let current: u64 = entry.value.parse().map_err(|_| StoreError::Command {
            operation: "incr_with_expiry",
            reason: format!("value at {key} is not an integer"),
        })?;
        let next = current.saturating_add(amount);
        entry.value = next.to_string();
        if next == amount {
            entry.expires_at = Some(now + expiry);
        }
        Ok(next)
    }

    fn ttl_now(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut inner = self.lock();
        inner.check("ttl")?;
        let now = Instant::now();
        inner.purge_expired(key, now);
        Ok(inner
            .values
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now)))
    }

    fn delete_matching_now(&self, pattern: &str, batch_size: usize) -> StoreResult<u64> {
        let mut inner = self.lock();
        inner.check("delete_matching")?;
        let mut doomed: Vec<String> = inner
            .values
            .keys()
            .chain(inner.sorted.keys())
            .filter(|key| glob_matches(pattern, key))
            .cloned()
            .collect();
        doomed.sort();
        doomed.dedup();
        let mut removed = 0u64;
        for batch in doomed.chunks(batch_size.max(1)) {
            for key in batch {
                let dropped_value = inner.values.remove(key).is_some();
                let dropped_set = inner.sorted.remove(key).is_some();
                if dropped_value || dropped_set {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<String>>> {
        Box::pin(async move { self.get_now(key) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { self.set_now(key, value) })
    }

    fn zadd<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: u64,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move { self.zadd_now(key, member, score) })
    }

    fn zrange_by_score<'a>(
        &'a self,
        key: &'a str,
        min: u64,
        max: u64,
    ) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move { self.zrange_now(key, min, max) })
    }

    fn zrem_range_by_score<'a>(
        &'a self,
        key: &'a str,
        min: u64,
        max: u64,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move { self.zrem_now(key, min, max) })
    }

    fn incr_with_expiry<'a>(
        &'a self,
        key: &'a str,
        amount: u64,
        expiry: Duration,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move { self.incr_now(key, amount, expiry) })
    }

    fn ttl<'a>(&'a self, key: &'a str) -> BoxFuture<'a, StoreResult<Option<Duration>>> {
        Box::pin(async move { self.ttl_now(key) })
    }

    fn delete_matching<'a>(
        &'a self,
        pattern: &'a str,
        batch_size: usize,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move { self.delete_matching_now(pattern, batch_size) })
    }
}

/// Redis-style glob supporting `*` and `?`.
pub(crate) fn glob_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    let (mut p, mut k) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == key[k]) {
            p += 1;
            k += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, k));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            k = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
