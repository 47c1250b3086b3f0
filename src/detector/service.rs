use super::chunks::chunks;
use super::source::EpochSource;
use crate::broker::{Outbox, OutboxHandle};
use crate::messages::EpochBroadcast;
use crate::runtime::config::{DetectorConfig, FallBehindPolicy};
use crate::runtime::retry::{retry_with_policy, sleep_with_cancellation, RetryDisposition};
use crate::runtime::runner::{Component, ComponentContext};
use crate::runtime::telemetry::Telemetry;
use crate::store::{KeyValueStore, StoreError, StoreKeys};
use crate::topics::Topics;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Result of one detection cycle that the loop can continue from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The epoch authority could not be read.
    SourceUnavailable,
    /// The checkpoint could not be loaded; nothing was broadcast.
    StoreUnavailable,
    /// The checkpoint already covers the network's current epoch.
    UpToDate,
    /// This many epochs were published and checkpointed.
    Broadcast(usize),
    /// The broker did not confirm a publish. `broadcast` epochs went out
    /// before it; the checkpoint stays at the last confirmed one.
    PublishFailed { broadcast: usize },
}

/// Conditions that stop the detector and require operator action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorError {
    /// The network reports an end height below the last broadcast one.
    CheckpointRegression { checkpoint_end: u64, network_end: u64 },
    /// The backlog exceeds the threshold under [`FallBehindPolicy::Halt`].
    FellBehind { lag: u64, threshold: u64 },
    /// The stored checkpoint cannot be decoded.
    CorruptCheckpoint { reason: String },
    /// The publish queue stopped accepting messages.
    OutboxClosed,
}

impl fmt::Display for DetectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectorError::CheckpointRegression {
                checkpoint_end,
                network_end,
            } => write!(
                f,
                "network epoch end {network_end} is behind checkpoint end {checkpoint_end}; \
                 reset the detector state"
            ),
            DetectorError::FellBehind { lag, threshold } => write!(
                f,
                "detector fell {lag} blocks behind (threshold {threshold}); reset the detector state"
            ),
            DetectorError::CorruptCheckpoint { reason } => {
                write!(f, "stored checkpoint is corrupt: {reason}")
            }
            DetectorError::OutboxClosed => write!(f, "publish queue closed"),
        }
    }
}

impl std::error::Error for DetectorError {}

/// Polls the epoch authority and broadcasts every epoch not yet covered by
/// the checkpoint, in ascending order.
pub struct EpochDetector {
    config: DetectorConfig,
    source: Arc<dyn EpochSource>,
    store: Arc<dyn KeyValueStore>,
    outbox: Outbox,
    keys: StoreKeys,
    topics: Topics,
    telemetry: Arc<Telemetry>,
    checkpoint: Option<EpochBroadcast>,
    shutdown: CancellationToken,
}

impl EpochDetector {
    pub fn new(
        config: DetectorConfig,
        source: Arc<dyn EpochSource>,
        store: Arc<dyn KeyValueStore>,
        outbox: Outbox,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let keys = StoreKeys::new(config.namespace());
        let topics = Topics::new(config.namespace(), config.instance_id());
        Self {
            config,
            source,
            store,
            outbox,
            keys,
            topics,
            telemetry,
            checkpoint: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_cancellation_token(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Last epoch handed to the broker, as held in memory.
    pub fn checkpoint(&self) -> Option<&EpochBroadcast> {
        self.checkpoint.as_ref()
    }

    pub fn outbox(&self) -> OutboxHandle {
        self.outbox.handle()
    }

    /// Runs one detection cycle.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, DetectorError> {
        let network = match self.source.current_epoch().await {
            Ok(epoch) => epoch,
            Err(err) => {
                self.telemetry.record_epoch_source_error();
                tracing::warn!(error = %err, "unable to fetch current epoch");
                return Ok(PollOutcome::SourceUnavailable);
            }
        };
        tracing::debug!(begin = network.begin, end = network.end, "current network epoch");

        if self.checkpoint.is_none() {
            match self.load_checkpoint().await {
                Ok(stored) => self.checkpoint = stored,
                Err(LoadError::Store(err)) => {
                    tracing::warn!(error = %err, "unable to load checkpoint; skipping cycle");
                    return Ok(PollOutcome::StoreUnavailable);
                }
                Err(LoadError::Corrupt(reason)) => {
                    return Err(DetectorError::CorruptCheckpoint { reason });
                }
            }
        }

        let Some(checkpoint_end) = self.checkpoint.as_ref().map(|checkpoint| checkpoint.end) else {
            tracing::info!(
                begin = network.begin,
                end = network.end,
                "no checkpoint found; broadcasting current epoch"
            );
            if !self.broadcast(EpochBroadcast::new(network)).await? {
                return Ok(PollOutcome::PublishFailed { broadcast: 0 });
            }
            return Ok(PollOutcome::Broadcast(1));
        };

        if checkpoint_end == network.end {
            tracing::debug!(end = network.end, "checkpoint is up to date");
            return Ok(PollOutcome::UpToDate);
        }

        if network.end < checkpoint_end {
            return Err(DetectorError::CheckpointRegression {
                checkpoint_end,
                network_end: network.end,
            });
        }

        let lag = network.end - checkpoint_end;
        let threshold = self.config.fall_behind_threshold();
        if lag > threshold {
            match self.config.fall_behind_policy() {
                FallBehindPolicy::Warn => tracing::warn!(
                    lag,
                    threshold,
                    "epochs are falling behind; consider resetting the detector state"
                ),
                FallBehindPolicy::Halt => {
                    return Err(DetectorError::FellBehind { lag, threshold });
                }
            }
        }

        let mut broadcast = 0usize;
        let mut pending = chunks(checkpoint_end + 1, network.end, network.span()).peekable();
        while let Some(epoch) = pending.next() {
            if !self.broadcast(EpochBroadcast::new(epoch)).await? {
                return Ok(PollOutcome::PublishFailed { broadcast });
            }
            broadcast += 1;

            if pending.peek().is_some()
                && sleep_with_cancellation(self.config.chunk_delay(), Some(&self.shutdown))
                    .await
                    .is_err()
            {
                tracing::info!(broadcast, "shutdown requested; stopping between chunks");
                break;
            }
        }

        Ok(PollOutcome::Broadcast(broadcast))
    }

    /// Polls until cancelled. Fatal conditions are handed to the fatal-error
    /// handler and returned. The publish queue is drained and the checkpoint written
    /// before returning either way.
    pub async fn run(mut self, ctx: ComponentContext) -> Result<()> {
        self.shutdown = ctx.shutdown.clone();
        tracing::info!(
            namespace = self.keys.namespace(),
            routing_key = %self.topics.epoch_released(),
            "epoch detector started"
        );

        let mut failure = None;
        while !self.shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(outcome) => tracing::trace!(?outcome, "poll cycle finished"),
                Err(err) => {
                    failure = Some(ctx.fatal.trigger("detector", err.into()));
                    break;
                }
            }

            if sleep_with_cancellation(self.config.polling_interval(), Some(&self.shutdown))
                .await
                .is_err()
            {
                break;
            }
        }

        let finished = self.finish().await;
        match failure {
            Some(err) => Err(err),
            None => finished,
        }
    }

    /// Drains the publish queue, then persists the in-memory checkpoint.
    pub async fn finish(self) -> Result<()> {
        let stats = self.outbox.drain().await?;
        tracing::info!(
            published = stats.published,
            failed = stats.failed,
            "publish queue drained"
        );

        if let Some(checkpoint) = &self.checkpoint {
            let encoded = serde_json::to_string(checkpoint).context("failed to encode checkpoint")?;
            persist(
                self.store.as_ref(),
                &self.keys.last_processed_epoch(),
                &encoded,
                &self.config,
                None,
            )
            .await
            .context("failed to save final checkpoint")?;
            tracing::info!(
                begin = checkpoint.begin,
                end = checkpoint.end,
                "final checkpoint saved"
            );
        }
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<EpochBroadcast>, LoadError> {
        let raw = self
            .store
            .get(&self.keys.last_processed_epoch())
            .await
            .map_err(LoadError::Store)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let checkpoint: EpochBroadcast =
            serde_json::from_str(&raw).map_err(|err| LoadError::Corrupt(err.to_string()))?;
        checkpoint
            .validate()
            .map_err(|err| LoadError::Corrupt(err.to_string()))?;
        tracing::info!(
            begin = checkpoint.begin,
            end = checkpoint.end,
            "resuming from stored checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Publishes one epoch and, once the broker confirmed it, advances and
    /// persists the checkpoint. Returns `false` when the publish was not
    /// confirmed; the checkpoint is left untouched.
    async fn broadcast(&mut self, broadcast: EpochBroadcast) -> Result<bool, DetectorError> {
        let routing_key = self.topics.epoch_released();
        tracing::info!(
            begin = broadcast.begin,
            end = broadcast.end,
            broadcast_id = %broadcast.broadcast_id,
            "broadcasting epoch"
        );
        let outbox = self.outbox.handle();
        outbox
            .enqueue_json(routing_key, &broadcast)
            .await
            .map_err(|_| DetectorError::OutboxClosed)?;

        let confirmed = tokio::select! {
            biased;
            flushed = outbox.flush() => flushed,
            _ = self.shutdown.cancelled() => {
                Err(anyhow!("shutdown requested before the publish was confirmed"))
            }
        };
        if let Err(err) = confirmed {
            tracing::warn!(
                begin = broadcast.begin,
                end = broadcast.end,
                error = %err,
                "epoch broadcast not confirmed; checkpoint unchanged"
            );
            return Ok(false);
        }
        self.telemetry.record_epoch_broadcast();

        let encoded = match serde_json::to_string(&broadcast) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode checkpoint");
                self.checkpoint = Some(broadcast);
                return Ok(true);
            }
        };
        self.checkpoint = Some(broadcast);

        if let Err(err) = persist(
            self.store.as_ref(),
            &self.keys.last_processed_epoch(),
            &encoded,
            &self.config,
            Some(&self.shutdown),
        )
        .await
        {
            self.telemetry.record_checkpoint_write_failure();
            tracing::error!(error = %err, "unable to save checkpoint; will retry on next epoch");
        }
        Ok(true)
    }
}

impl Component for EpochDetector {
    fn name(&self) -> &'static str {
        "epoch-detector"
    }

    fn run(self: Box<Self>, ctx: ComponentContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(EpochDetector::run(*self, ctx))
    }
}

#[derive(Debug)]
enum LoadError {
    Store(StoreError),
    Corrupt(String),
}

async fn persist(
    store: &dyn KeyValueStore,
    key: &str,
    encoded: &str,
    config: &DetectorConfig,
    cancellation: Option<&CancellationToken>,
) -> Result<(), StoreError> {
    retry_with_policy(
        config.checkpoint_retry(),
        cancellation,
        move |_| store.set(key, encoded),
        |err: &StoreError| {
            if err.is_transient() {
                RetryDisposition::Retry
            } else {
                RetryDisposition::Abort
            }
        },
        |attempt, delay, err| {
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "checkpoint write failed; retrying"
            );
        },
    )
    .await
    .map_err(|err| {
        err.into_source().unwrap_or(StoreError::Unavailable {
            reason: "checkpoint write cancelled".into(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::detector::source::EpochSourceError;
    use crate::messages::Epoch;
    use crate::runtime::retry::RetryPolicy;
    use crate::store::memory::FaultMode;
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays a fixed sequence of authority answers; repeats the last one.
    struct ScriptedSource {
        answers: Mutex<VecDeque<Result<Epoch, u16>>>,
    }

    impl ScriptedSource {
        fn new(answers: Vec<Result<Epoch, u16>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
            })
        }
    }

    impl EpochSource for ScriptedSource {
        fn current_epoch(&self) -> BoxFuture<'_, Result<Epoch, EpochSourceError>> {
            let answer = {
                let mut answers = self.answers.lock().unwrap();
                if answers.len() > 1 {
                    answers.pop_front().unwrap()
                } else {
                    answers.front().cloned().unwrap()
                }
            };
            Box::pin(async move { answer.map_err(EpochSourceError::Status) })
        }
    }

    struct Harness {
        detector: EpochDetector,
        store: Arc<MemoryStore>,
        broker: Arc<MemoryBroker>,
        telemetry: Arc<Telemetry>,
    }

    impl Harness {
        fn released(&self) -> Vec<EpochBroadcast> {
            self.broker
                .published_json(&Topics::new("test", "node").epoch_released())
                .unwrap()
        }

        async fn stored_checkpoint(&self) -> Option<EpochBroadcast> {
            self.store
                .get("test:lastProcessedEpoch")
                .await
                .unwrap()
                .map(|raw| serde_json::from_str(&raw).unwrap())
        }
    }

    fn harness(answers: Vec<Result<Epoch, u16>>, policy: FallBehindPolicy) -> Harness {
        let config = DetectorConfig::builder()
            .namespace("test")
            .instance_id("node")
            .authority_url("http://authority.local/epoch")
            .chunk_delay(Duration::ZERO)
            .fall_behind_threshold(500)
            .fall_behind_policy(policy)
            .checkpoint_retry(
                RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1))
                    .with_max_attempts(2),
            )
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let telemetry = Arc::new(Telemetry::default());
        let outbox = Outbox::spawn(
            broker.clone(),
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(1))
                .with_max_attempts(2),
            telemetry.clone(),
        );
        let detector = EpochDetector::new(
            config,
            ScriptedSource::new(answers),
            store.clone(),
            outbox,
            telemetry.clone(),
        );
        Harness {
            detector,
            store,
            broker,
            telemetry,
        }
    }

    fn epoch(begin: u64, end: u64) -> Epoch {
        Epoch::new(begin, end).unwrap()
    }

    async fn seed_checkpoint(store: &MemoryStore, begin: u64, end: u64) {
        let mut checkpoint = EpochBroadcast::new(epoch(begin, end));
        checkpoint.broadcast_id = "seed".into();
        store
            .set(
                "test:lastProcessedEpoch",
                &serde_json::to_string(&checkpoint).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_run_broadcasts_current_epoch() {
        let mut h = harness(vec![Ok(epoch(1, 100))], FallBehindPolicy::Warn);

        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::Broadcast(1)));
        h.detector.outbox().flush().await.unwrap();

        let released = h.released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].epoch(), epoch(1, 100));
        assert_eq!(h.stored_checkpoint().await.unwrap(), released[0]);
    }

    #[tokio::test]
    async fn equal_checkpoint_broadcasts_nothing() {
        let mut h = harness(vec![Ok(epoch(1, 100))], FallBehindPolicy::Warn);
        seed_checkpoint(&h.store, 1, 100).await;

        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::UpToDate));
        h.detector.outbox().flush().await.unwrap();

        assert!(h.released().is_empty());
        assert_eq!(h.stored_checkpoint().await.unwrap().broadcast_id, "seed");
    }

    #[tokio::test]
    async fn next_epoch_is_broadcast_once_and_persisted() {
        let mut h = harness(vec![Ok(epoch(101, 200))], FallBehindPolicy::Warn);
        seed_checkpoint(&h.store, 1, 100).await;

        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::Broadcast(1)));
        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::UpToDate));
        h.detector.outbox().flush().await.unwrap();

        let released = h.released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].epoch(), epoch(101, 200));
        assert_eq!(h.stored_checkpoint().await.unwrap().epoch(), epoch(101, 200));
        assert_eq!(h.telemetry.snapshot().epochs_broadcast, 1);
    }

    #[tokio::test]
    async fn backlog_is_chunked_in_ascending_order() {
        let mut h = harness(vec![Ok(epoch(301, 400))], FallBehindPolicy::Warn);
        seed_checkpoint(&h.store, 1, 100).await;

        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::Broadcast(3)));
        h.detector.outbox().flush().await.unwrap();

        let ranges: Vec<Epoch> = h.released().iter().map(EpochBroadcast::epoch).collect();
        assert_eq!(ranges, vec![epoch(101, 200), epoch(201, 300), epoch(301, 400)]);
        let ids: std::collections::HashSet<String> = h
            .released()
            .into_iter()
            .map(|broadcast| broadcast.broadcast_id)
            .collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(h.stored_checkpoint().await.unwrap().epoch(), epoch(301, 400));
    }

    #[tokio::test]
    async fn unconfirmed_publish_leaves_the_checkpoint_in_place() {
        let mut h = harness(vec![Ok(epoch(101, 200))], FallBehindPolicy::Warn);
        seed_checkpoint(&h.store, 1, 100).await;
        h.broker.fail_next_publishes(1000);

        assert_eq!(
            h.detector.poll_once().await,
            Ok(PollOutcome::PublishFailed { broadcast: 0 })
        );
        assert!(h.released().is_empty());
        assert_eq!(h.stored_checkpoint().await.unwrap().epoch(), epoch(1, 100));
        assert_eq!(h.detector.checkpoint().unwrap().epoch(), epoch(1, 100));
        assert_eq!(h.telemetry.snapshot().epochs_broadcast, 0);

        h.broker.fail_next_publishes(0);
        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::Broadcast(1)));
        let released = h.released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].epoch(), epoch(101, 200));
        assert_eq!(h.stored_checkpoint().await.unwrap().epoch(), epoch(101, 200));
    }

    #[tokio::test]
    async fn regression_is_fatal_and_broadcasts_nothing() {
        let mut h = harness(vec![Ok(epoch(51, 150))], FallBehindPolicy::Warn);
        seed_checkpoint(&h.store, 101, 200).await;

        assert_eq!(
            h.detector.poll_once().await,
            Err(DetectorError::CheckpointRegression {
                checkpoint_end: 200,
                network_end: 150
            })
        );
        h.detector.outbox().flush().await.unwrap();
        assert!(h.released().is_empty());
    }

    #[tokio::test]
    async fn fall_behind_warns_by_default_and_halts_when_configured() {
        let mut warn = harness(vec![Ok(epoch(901, 1000))], FallBehindPolicy::Warn);
        seed_checkpoint(&warn.store, 1, 100).await;
        assert_eq!(warn.detector.poll_once().await, Ok(PollOutcome::Broadcast(9)));

        let mut halt = harness(vec![Ok(epoch(901, 1000))], FallBehindPolicy::Halt);
        seed_checkpoint(&halt.store, 1, 100).await;
        assert_eq!(
            halt.detector.poll_once().await,
            Err(DetectorError::FellBehind {
                lag: 900,
                threshold: 500
            })
        );
    }

    #[tokio::test]
    async fn source_failures_are_recoverable() {
        let mut h = harness(vec![Err(503), Ok(epoch(1, 100))], FallBehindPolicy::Warn);

        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::SourceUnavailable));
        assert_eq!(h.telemetry.snapshot().epoch_source_errors, 1);
        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::Broadcast(1)));
    }

    #[tokio::test]
    async fn unreadable_store_blocks_broadcasting() {
        let mut h = harness(vec![Ok(epoch(1, 100))], FallBehindPolicy::Warn);
        h.store.set_fault(FaultMode::Unavailable);

        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::StoreUnavailable));
        h.detector.outbox().flush().await.unwrap();
        assert!(h.released().is_empty());
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_fatal() {
        let mut h = harness(vec![Ok(epoch(1, 100))], FallBehindPolicy::Warn);
        h.store.set("test:lastProcessedEpoch", "not json").await.unwrap();

        assert!(matches!(
            h.detector.poll_once().await,
            Err(DetectorError::CorruptCheckpoint { .. })
        ));
    }

    #[tokio::test]
    async fn failed_checkpoint_write_still_advances_in_memory() {
        let mut h = harness(
            vec![Ok(epoch(1, 100)), Ok(epoch(101, 200))],
            FallBehindPolicy::Warn,
        );
        seed_checkpoint(&h.store, 1, 100).await;
        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::UpToDate));

        h.store.set_fault(FaultMode::CommandError);
        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::Broadcast(1)));
        assert_eq!(h.telemetry.snapshot().checkpoint_write_failures, 1);
        assert_eq!(h.detector.checkpoint().unwrap().epoch(), epoch(101, 200));
        assert_eq!(h.detector.poll_once().await, Ok(PollOutcome::UpToDate));

        h.store.set_fault(FaultMode::Healthy);
        let Harness { detector, store, .. } = h;
        detector.finish().await.unwrap();
        let raw = store.get("test:lastProcessedEpoch").await.unwrap().unwrap();
        let stored: EpochBroadcast = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.epoch(), epoch(101, 200));
    }

    #[tokio::test]
    async fn run_stops_on_cancellation_and_saves_checkpoint() {
        let h = harness(vec![Ok(epoch(1, 100))], FallBehindPolicy::Warn);
        let shutdown = CancellationToken::new();
        let ctx = ComponentContext {
            shutdown: shutdown.clone(),
            fatal: crate::runtime::fatal::FatalErrorHandler::new(CancellationToken::new()),
            telemetry: h.telemetry.clone(),
        };
        let Harness {
            detector,
            store,
            broker,
            ..
        } = h;

        let task = tokio::spawn(detector.run(ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(broker.published().len(), 1);
        assert!(store.get("test:lastProcessedEpoch").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_reports_regression_as_fatal() {
        let h = harness(vec![Ok(epoch(1, 50))], FallBehindPolicy::Warn);
        seed_checkpoint(&h.store, 51, 100).await;
        let root = CancellationToken::new();
        let fatal = crate::runtime::fatal::FatalErrorHandler::new(root.clone());
        let ctx = ComponentContext {
            shutdown: root.child_token(),
            fatal: fatal.clone(),
            telemetry: h.telemetry.clone(),
        };

        let err = h.detector.run(ctx).await.unwrap_err();
        assert!(err.to_string().contains("behind checkpoint end 100"));
        assert!(root.is_cancelled());
        assert!(fatal.error().is_some());
    }
}
