use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use epochcast::{
    AggregatorConfig, DetectorConfig, DistributorConfig, EpochBroadcast, KeyValueStore,
    MemoryBroker, RetryPolicy, StoreKeys,
};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

pub const NAMESPACE: &str = "itest";
pub const INSTANCE_ID: &str = "node1";

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(20)).with_max_attempts(3)
}

pub fn detector_config(authority_url: &str) -> Result<DetectorConfig> {
    DetectorConfig::builder()
        .namespace(NAMESPACE)
        .instance_id(INSTANCE_ID)
        .authority_url(authority_url)
        .polling_interval(Duration::from_millis(50))
        .chunk_delay(Duration::from_millis(5))
        .source_timeout(Duration::from_secs(2))
        .checkpoint_retry(fast_retry())
        .build()
}

pub fn distributor_config() -> Result<DistributorConfig> {
    DistributorConfig::builder()
        .namespace(NAMESPACE)
        .instance_id(INSTANCE_ID)
        .chain_id(137)
        .project("pairTotalReserves", ["0xAbC", "0xDeF"])
        .aggregator(AggregatorConfig::multi_project(
            "tradeVolumeAll",
            ["volume:0xabc", "volume:0xdef"],
        ))
        .requeue_backoff(fast_retry())
        .build()
}

pub async fn wait_for_published(
    broker: &MemoryBroker,
    routing_key: &str,
    target: usize,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let current = broker.published_to(routing_key).len();
        if current >= target {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!(
                "{routing_key} did not receive {target} messages within {:?} (received: {current})",
                timeout
            );
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_for_checkpoint_end(
    store: &Arc<dyn KeyValueStore>,
    target: u64,
    timeout: Duration,
) -> Result<EpochBroadcast> {
    let key = StoreKeys::new(NAMESPACE).last_processed_epoch();
    let start = Instant::now();
    loop {
        let current = match store.get(&key).await? {
            Some(raw) => Some(serde_json::from_str::<EpochBroadcast>(&raw)?),
            None => None,
        };
        if let Some(checkpoint) = &current {
            if checkpoint.end >= target {
                return Ok(checkpoint.clone());
            }
        }
        if start.elapsed() > timeout {
            let reported = current
                .map(|checkpoint| checkpoint.end.to_string())
                .unwrap_or_else(|| "<none>".to_owned());
            bail!(
                "checkpoint did not reach end {target} within {:?} (last end: {reported})",
                timeout
            );
        }
        sleep(Duration::from_millis(20)).await;
    }
}

pub fn assert_contiguous(epochs: &[EpochBroadcast]) {
    for window in epochs.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs.begin, lhs.end + 1, "epochs must tile the block range");
        }
    }
}
