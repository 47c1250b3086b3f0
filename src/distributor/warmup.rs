use anyhow::Result;
use futures::future::BoxFuture;

/// Pre-fetches chain data shared by the snapshot workers of an epoch before
/// the epoch is fanned out. Failures never block distribution.
pub trait CacheWarmer: Send + Sync {
    fn warm_up(&self, begin: u64, end: u64) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheWarmer;

impl CacheWarmer for NoopCacheWarmer {
    fn warm_up(&self, _begin: u64, _end: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
