use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use epochcast::{
    EpochDetector, HttpEpochSource, KeyValueStore, Outbox, ProcessorDistributor, RateLimiter,
    RedisBroker, RedisStore, RetryPolicy, Runner, Settings, StoreKeys, Telemetry, Topics,
};

const DEFAULT_SETTINGS_PATH: &str = "settings.json";
const DEFAULT_LOG_DIRECTIVE: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    init_demo_tracing();

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_owned());
    let settings = Settings::from_file(&path)?;
    let detector_config = settings.detector_config()?;
    let distributor_config = settings.distributor_config()?;
    let topics = Topics::new(&settings.namespace, &settings.instance_id);
    let keys = StoreKeys::new(&settings.namespace);

    let store: Arc<dyn KeyValueStore> = Arc::new(
        RedisStore::connect(&settings.redis_url)
            .await
            .context("failed to connect the store")?,
    );
    let queue = format!(
        "{}:{}:processorDistributor",
        settings.namespace, settings.instance_id
    );
    let broker = Arc::new(RedisBroker::connect(&settings.redis_url, queue).await?);
    broker.bind(&topics.inbound_binding()).await?;
    broker.recover_in_flight().await?;

    let telemetry = Arc::new(Telemetry::default());
    let mut source =
        HttpEpochSource::new(detector_config.authority_url(), detector_config.source_timeout())?;
    let limits = settings.rate_limits()?;
    if !limits.is_empty() {
        let limiter = RateLimiter::new(store.clone(), keys, limits).with_telemetry(telemetry.clone());
        source = source.with_rate_limiter(limiter);
    }

    let publish_retry = RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(5));
    let detector = EpochDetector::new(
        detector_config.clone(),
        Arc::new(source),
        store.clone(),
        Outbox::spawn(broker.clone(), publish_retry, telemetry.clone()),
        telemetry.clone(),
    );
    let distributor = ProcessorDistributor::new(
        distributor_config,
        broker.clone(),
        store,
        Outbox::spawn(broker.clone(), publish_retry, telemetry.clone()),
        telemetry.clone(),
    );

    let mut runner = Runner::new(telemetry);
    runner.add(detector).add(distributor);
    let outcome = runner.run_until_signal().await;
    broker.close();
    outcome
}

fn init_demo_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    epochcast::init_tracing();
}
