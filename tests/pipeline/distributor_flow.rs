use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{
        assert_contiguous, detector_config, distributor_config, fast_retry, init_tracing,
        wait_for_checkpoint_end, wait_for_published, INSTANCE_ID, NAMESPACE,
    },
    mock_authority::{MockAuthority, MockAuthorityServer},
};
use anyhow::Result;
use epochcast::{
    AggregateMessage, EpochBroadcast, EpochDetector, HttpEpochSource, KeyValueStore,
    MemoryBroker, MemoryStore, MessagePublisher, Outbox, PayloadCommitMessage,
    ProcessorDistributor, Runner, SnapshotProcessMessage, Telemetry, Topics,
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn epochs_flow_from_authority_to_aggregate() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(1, 10);
    let server = MockAuthorityServer::start(authority.clone()).await?;
    let topics = Topics::new(NAMESPACE, INSTANCE_ID);

    let broker = Arc::new(MemoryBroker::new());
    broker.bind(topics.inbound_binding());
    let memory_store = Arc::new(MemoryStore::new());
    let store: Arc<dyn KeyValueStore> = memory_store.clone();
    let telemetry = Arc::new(Telemetry::default());

    let config = detector_config(server.url())?;
    let source = HttpEpochSource::new(server.url(), config.source_timeout())?;
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
        store.clone(),
        Outbox::spawn(broker.clone(), fast_retry(), telemetry.clone()),
        telemetry.clone(),
    );

    let mut runner = Runner::new(telemetry.clone());
    runner.add(detector).add(distributor);
    runner.start();

    let fan_out_key = topics.snapshot_process("pairTotalReserves");
    wait_for_published(&broker, &fan_out_key, 2, WAIT).await?;

    authority.advance(2);
    wait_for_published(&broker, &fan_out_key, 6, WAIT).await?;

    let work: Vec<SnapshotProcessMessage> = broker.published_json(&fan_out_key)?;
    let contracts: Vec<&str> = work.iter().map(|m| m.contract.as_str()).collect();
    assert_eq!(
        contracts,
        vec!["0xabc", "0xdef", "0xabc", "0xdef", "0xabc", "0xdef"]
    );
    let first_broadcast = work[0].broadcast_id.clone();
    assert_eq!(
        memory_store.sorted_len(&format!(
            "{NAMESPACE}:broadcastProcessingLogs:{first_broadcast}"
        )),
        2
    );

    // Snapshot workers report back for the first epoch.
    for project in ["volume:0xdef", "volume:0xabc"] {
        let report = json!({
            "epochId": 1,
            "projectId": project,
            "snapshotCid": format!("bafy-{project}"),
            "begin": 1,
            "end": 10,
            "timestamp": 1_700_000_000u64,
        });
        broker
            .publish(&topics.snapshot_finalized(), report.to_string().as_bytes())
            .await?;
    }

    let aggregate_key = topics.calculate_aggregate("tradeVolumeAll");
    wait_for_published(&broker, &aggregate_key, 1, WAIT).await?;
    wait_for_published(&broker, &topics.commit_payload(), 2, WAIT).await?;

    wait_for_checkpoint_end(&store, 30, WAIT).await?;
    runner.stop().await?;

    let aggregates: Vec<AggregateMessage> = broker.published_json(&aggregate_key)?;
    assert_eq!(aggregates.len(), 1);
    let order: Vec<&str> = aggregates[0]
        .messages
        .iter()
        .map(|m| m.project_id.as_str())
        .collect();
    assert_eq!(order, vec!["volume:0xabc", "volume:0xdef"]);
    assert_eq!(
        memory_store.sorted_len(&format!("{NAMESPACE}:aggregator:tradeVolumeAll:events")),
        0
    );

    let commits: Vec<PayloadCommitMessage> = broker.published_json(&topics.commit_payload())?;
    assert!(commits
        .iter()
        .all(|commit| commit.source_chain_id == 137 && commit.web3_storage));

    let epochs: Vec<EpochBroadcast> = broker.published_json(&topics.epoch_released())?;
    assert_eq!(epochs.len(), 3);
    assert_contiguous(&epochs);

    let snapshot = telemetry.snapshot();
    assert_eq!(snapshot.epochs_broadcast, 3);
    assert_eq!(snapshot.fan_out_messages, 6);
    assert_eq!(snapshot.aggregates_emitted, 1);
    assert_eq!(snapshot.deliveries_acked, 5);
    assert_eq!(broker.in_flight_len(), 0);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_persists_the_last_broadcast_epoch() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(11, 20);
    let server = MockAuthorityServer::start(authority.clone()).await?;

    let broker = Arc::new(MemoryBroker::new());
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let telemetry = Arc::new(Telemetry::default());
    let config = detector_config(server.url())?;
    let source = HttpEpochSource::new(server.url(), config.source_timeout())?;
    let detector = EpochDetector::new(
        config,
        Arc::new(source),
        store.clone(),
        Outbox::spawn(broker.clone(), fast_retry(), telemetry.clone()),
        telemetry.clone(),
    );

    let mut runner = Runner::new(telemetry.clone());
    runner.add(detector);
    runner.start();

    let topics = Topics::new(NAMESPACE, INSTANCE_ID);
    wait_for_published(&broker, &topics.epoch_released(), 1, WAIT).await?;
    runner.stop().await?;

    let checkpoint = wait_for_checkpoint_end(&store, 20, WAIT).await?;
    assert_eq!(checkpoint.begin, 11);
    let published: Vec<EpochBroadcast> = broker.published_json(&topics.epoch_released())?;
    assert_eq!(published.last().map(|b| &b.broadcast_id), Some(&checkpoint.broadcast_id));

    server.shutdown().await;
    Ok(())
}
