use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{assert_contiguous, detector_config, fast_retry, init_tracing, NAMESPACE},
    mock_authority::{MockAuthority, MockAuthorityServer},
};
use anyhow::Result;
use epochcast::{
    Epoch, EpochBroadcast, EpochDetector, EpochSource, EpochSourceError, HttpEpochSource,
    KeyValueStore, MemoryBroker, MemoryStore, Outbox, PollOutcome, RateLimit, RateLimiter,
    StoreKeys, Telemetry, Topics,
};
use hyper::StatusCode;

#[tokio::test]
async fn http_source_reads_the_current_epoch() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(101, 200);
    let server = MockAuthorityServer::start(authority.clone()).await?;

    let source = HttpEpochSource::new(server.url(), Duration::from_secs(2))?;
    let epoch = source.current_epoch().await?;
    assert_eq!(epoch, Epoch { begin: 101, end: 200 });
    assert_eq!(authority.request_count(), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn http_source_classifies_failures() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(1, 10);
    let server = MockAuthorityServer::start(authority.clone()).await?;
    let source = HttpEpochSource::new(server.url(), Duration::from_secs(2))?;

    authority.fail_with(Some(StatusCode::SERVICE_UNAVAILABLE));
    assert!(matches!(
        source.current_epoch().await,
        Err(EpochSourceError::Status(503))
    ));

    authority.fail_with(None);
    authority.serve_raw(Some(r#"{"epochStartBlockHeight":"soon"}"#));
    assert!(matches!(
        source.current_epoch().await,
        Err(EpochSourceError::Decode(_))
    ));

    authority.serve_raw(Some(
        r#"{"epochStartBlockHeight":20,"epochEndBlockHeight":10}"#,
    ));
    assert!(matches!(
        source.current_epoch().await,
        Err(EpochSourceError::Invalid(_))
    ));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rate_limited_source_stops_calling_upstream() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(1, 10);
    let server = MockAuthorityServer::start(authority.clone()).await?;

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let telemetry = Arc::new(Telemetry::default());
    let limiter = RateLimiter::new(
        store,
        StoreKeys::new(NAMESPACE),
        RateLimit::parse_many("2/minute")?,
    )
    .with_telemetry(telemetry.clone());
    let source =
        HttpEpochSource::new(server.url(), Duration::from_secs(2))?.with_rate_limiter(limiter);

    source.current_epoch().await?;
    source.current_epoch().await?;
    let limited = match source.current_epoch().await {
        Err(EpochSourceError::RateLimited(limited)) => limited,
        other => panic!("expected a rate-limit rejection, got {other:?}"),
    };
    assert!(limited.retry_after().is_some());
    assert_eq!(authority.request_count(), 2);
    assert_eq!(telemetry.snapshot().rate_limit_rejections, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn detector_catches_up_over_http() -> Result<()> {
    init_tracing();
    let authority = MockAuthority::new(401, 500);
    let server = MockAuthorityServer::start(authority.clone()).await?;

    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let keys = StoreKeys::new(NAMESPACE);
    let seeded = EpochBroadcast {
        begin: 1,
        end: 100,
        broadcast_id: "seed".into(),
        epoch_id: None,
    };
    store
        .set(&keys.last_processed_epoch(), &serde_json::to_string(&seeded)?)
        .await?;

    let broker = Arc::new(MemoryBroker::new());
    let telemetry = Arc::new(Telemetry::default());
    let outbox = Outbox::spawn(broker.clone(), fast_retry(), telemetry.clone());
    let config = detector_config(server.url())?;
    let source = HttpEpochSource::new(server.url(), config.source_timeout())?;
    let mut detector =
        EpochDetector::new(config, Arc::new(source), store.clone(), outbox, telemetry.clone());

    assert_eq!(detector.poll_once().await?, PollOutcome::Broadcast(4));
    assert_eq!(detector.poll_once().await?, PollOutcome::UpToDate);
    detector.finish().await?;

    let topics = Topics::new(NAMESPACE, "node1");
    let published: Vec<EpochBroadcast> = broker.published_json(&topics.epoch_released())?;
    let ranges: Vec<(u64, u64)> = published.iter().map(|b| (b.begin, b.end)).collect();
    assert_eq!(ranges, vec![(101, 200), (201, 300), (301, 400), (401, 500)]);
    assert_contiguous(&published);

    let stored = store
        .get(&keys.last_processed_epoch())
        .await?
        .expect("checkpoint persisted");
    let checkpoint: EpochBroadcast = serde_json::from_str(&stored)?;
    assert_eq!(checkpoint.end, 500);
    assert_eq!(checkpoint.broadcast_id, published[3].broadcast_id);
    assert_eq!(telemetry.snapshot().epochs_broadcast, 4);

    server.shutdown().await;
    Ok(())
}
