use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{detector_config, distributor_config, fast_retry, init_tracing, NAMESPACE},
    mock_authority::{MockAuthority, MockAuthorityServer},
};
use anyhow::{Context, Result};
use epochcast::{
    DetectorConfig, EpochBroadcast, EpochDetector, FallBehindPolicy, HttpEpochSource,
    KeyValueStore, MemoryBroker, MemoryStore, Outbox, ProcessorDistributor, Runner, StoreKeys,
    Telemetry,
};
use tokio::time::timeout;

async fn seeded_store(end: u64) -> Result<Arc<dyn KeyValueStore>> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let checkpoint = EpochBroadcast {
        begin: end.saturating_sub(9),
        end,
        broadcast_id: "previous-run".into(),
        epoch_id: None,
    };
    store
        .set(
            &StoreKeys::new(NAMESPACE).last_processed_epoch(),
            &serde_json::to_string(&checkpoint)?,
        )
        .await?;
    Ok(store)
}

fn runner_with_detector(
    config: DetectorConfig,
    store: Arc<dyn KeyValueStore>,
    broker: Arc<MemoryBroker>,
) -> Result<Runner> {
    let telemetry = Arc::new(Telemetry::default());
    let source = HttpEpochSource::new(config.authority_url(), config.source_timeout())?;
    let detector = EpochDetector::new(
        config,
        Arc::new(source),
        store.clone(),
        Outbox::spawn(broker.clone(), fast_retry(), telemetry.clone()),
        telemetry.clone(),
    );
    let distributor = ProcessorDistributor::new(
        distributor_config()?,
        broker.clone(),
        store,
        Outbox::spawn(broker, fast_retry(), telemetry.clone()),
        telemetry.clone(),
    );

    let mut runner = Runner::new(telemetry);
    runner.add(detector).add(distributor);
    Ok(runner)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_exits_on_checkpoint_regression() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(1, 10);
    let server = MockAuthorityServer::start(authority).await?;
    let store = seeded_store(500).await?;
    let broker = Arc::new(MemoryBroker::new());

    let mut runner = runner_with_detector(detector_config(server.url())?, store, broker.clone())?;
    let outcome = timeout(Duration::from_secs(5), runner.run_until_signal())
        .await
        .context("runner should stop after a checkpoint regression")?;

    let err = outcome.expect_err("regression should abort the runner");
    let message = format!("{err:#}");
    assert!(
        message.contains("reset the detector state"),
        "runner did not propagate the regression, got {message}"
    );
    assert!(broker.published().is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn halting_policy_stops_a_lagging_detector() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(9_991, 10_000);
    let server = MockAuthorityServer::start(authority).await?;
    let store = seeded_store(10).await?;
    let broker = Arc::new(MemoryBroker::new());

    let config = DetectorConfig::builder()
        .namespace(NAMESPACE)
        .instance_id("node1")
        .authority_url(server.url())
        .polling_interval(Duration::from_millis(50))
        .fall_behind_threshold(100)
        .fall_behind_policy(FallBehindPolicy::Halt)
        .build()?;
    let mut runner = runner_with_detector(config, store.clone(), broker.clone())?;
    runner.start();
    let fatal = runner.fatal_handler();
    timeout(Duration::from_secs(5), fatal.triggered())
        .await
        .context("fall-behind should trigger a fatal error")?;

    let err = runner.stop().await.expect_err("halt policy should fail the run");
    assert!(format!("{err:#}").contains("fell 9990 blocks behind"));
    assert!(broker.published().is_empty());

    let raw = store
        .get(&StoreKeys::new(NAMESPACE).last_processed_epoch())
        .await?
        .expect("checkpoint kept");
    let checkpoint: EpochBroadcast = serde_json::from_str(&raw)?;
    assert_eq!(checkpoint.broadcast_id, "previous-run");

    server.shutdown().await;
    Ok(())
}
