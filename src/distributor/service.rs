use super::aggregation::{AggregationTracker, JoinStatus};
use super::router::{decode, DecodeError, InboundMessage};
use super::warmup::{CacheWarmer, NoopCacheWarmer};
use crate::broker::{Delivery, DeliverySource, Outbox, OutboxHandle};
use crate::messages::{
    unix_timestamp, EpochBroadcast, PayloadCommitMessage, ProcessingLogEntry, ProcessingUpdate,
    PublishInfo, SnapshotFinalizedMessage, SnapshotProcessMessage,
};
use crate::runtime::config::{AggregationMode, AggregatorConfig, DistributorConfig};
use crate::runtime::retry::sleep_with_cancellation;
use crate::runtime::runner::{Component, ComponentContext};
use crate::runtime::telemetry::Telemetry;
use crate::store::{KeyValueStore, StoreError, StoreKeys};
use crate::topics::Topics;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PUBLISH_ACTION: &str = "Broker.Publish";

/// How a delivery is settled once handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    /// Dropped without redelivery.
    Reject,
    /// Returned to the queue after the requeue backoff.
    Requeue,
    /// Left unacknowledged; no handler exists for it.
    Ignore,
}

/// Failure while handling a decoded message. Everything here is retried by
/// requeueing the delivery.
#[derive(Debug)]
enum HandleError {
    Store(StoreError),
    Outbox(anyhow::Error),
}

impl From<StoreError> for HandleError {
    fn from(err: StoreError) -> Self {
        HandleError::Store(err)
    }
}

/// Routes inbound events to the snapshot workers and the downstream
/// aggregation and commit stages.
pub struct ProcessorDistributor {
    config: DistributorConfig,
    source: Arc<dyn DeliverySource>,
    store: Arc<dyn KeyValueStore>,
    outbox: Outbox,
    warmer: Arc<dyn CacheWarmer>,
    tracker: AggregationTracker,
    keys: StoreKeys,
    topics: Topics,
    telemetry: Arc<Telemetry>,
    consecutive_requeues: usize,
    shutdown: CancellationToken,
}

impl ProcessorDistributor {
    pub fn new(
        config: DistributorConfig,
        source: Arc<dyn DeliverySource>,
        store: Arc<dyn KeyValueStore>,
        outbox: Outbox,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let keys = StoreKeys::new(config.namespace());
        let topics = Topics::new(config.namespace(), config.instance_id());
        let tracker = AggregationTracker::new(Arc::clone(&store), keys.clone());
        Self {
            config,
            source,
            store,
            outbox,
            warmer: Arc::new(NoopCacheWarmer),
            tracker,
            keys,
            topics,
            telemetry,
            consecutive_requeues: 0,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_cache_warmer(mut self, warmer: Arc<dyn CacheWarmer>) -> Self {
        self.warmer = warmer;
        self
    }

    pub fn with_cancellation_token(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn outbox(&self) -> OutboxHandle {
        self.outbox.handle()
    }

    /// Handles one delivery and decides how it should be settled. Everything
    /// the delivery produced has been handed to the broker before `Ack` is
    /// returned.
    pub async fn handle_delivery(&mut self, delivery: &Delivery) -> DeliveryOutcome {
        let message = match decode(delivery) {
            Ok(message) => message,
            Err(err @ DecodeError::UnknownRoutingKey(_)) => {
                tracing::error!(error = %err, "no handler for delivery; leaving it unacknowledged");
                return DeliveryOutcome::Ignore;
            }
            Err(err) => {
                tracing::error!(
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "rejecting malformed delivery"
                );
                return DeliveryOutcome::Reject;
            }
        };

        let kind = message.kind();
        let handled = match message {
            InboundMessage::EpochReleased(broadcast) => self.distribute_epoch(&broadcast).await,
            InboundMessage::SnapshotFinalized(finalized) => {
                self.route_finalized(&finalized).await
            }
        };
        let flushed = match handled {
            Ok(()) => self.flush_outbox().await,
            Err(err) => Err(err),
        };

        match flushed {
            Ok(()) => DeliveryOutcome::Ack,
            Err(HandleError::Store(err)) => {
                tracing::warn!(event = kind, error = %err, "store error while handling delivery");
                DeliveryOutcome::Requeue
            }
            Err(HandleError::Outbox(err)) => {
                tracing::warn!(event = kind, error = %err, "publish queue unavailable");
                DeliveryOutcome::Requeue
            }
        }
    }

    /// Handles a delivery and settles it with the broker.
    pub async fn process(&mut self, delivery: &Delivery) -> DeliveryOutcome {
        let outcome = self.handle_delivery(delivery).await;
        if let Err(err) = self.settle(delivery, outcome).await {
            tracing::warn!(
                receipt = %delivery.receipt,
                ?outcome,
                error = %err,
                "failed to settle delivery; the broker will redeliver it"
            );
        }
        outcome
    }

    /// Consumes deliveries one at a time until cancelled or the source closes.
    /// The delivery in progress is always finished before returning.
    pub async fn run(mut self, ctx: ComponentContext) -> Result<()> {
        self.shutdown = ctx.shutdown.clone();
        tracing::info!(
            namespace = self.keys.namespace(),
            binding = %self.topics.inbound_binding(),
            worker = self.config.worker_name(),
            "processor distributor started"
        );

        let source = Arc::clone(&self.source);
        let mut receive_failures = 0usize;
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = source.next_delivery() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    receive_failures = 0;
                    self.process(&delivery).await;
                }
                Ok(None) => {
                    tracing::info!("delivery source closed");
                    break;
                }
                Err(err) => {
                    receive_failures += 1;
                    let delay = self.config.requeue_backoff().delay_for(receive_failures);
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "failed to receive delivery"
                    );
                    if sleep_with_cancellation(delay, Some(&self.shutdown)).await.is_err() {
                        break;
                    }
                }
            }
        }

        let stats = self.outbox.drain().await?;
        tracing::info!(
            published = stats.published,
            failed = stats.failed,
            "processor distributor stopped"
        );
        Ok(())
    }

    async fn settle(&mut self, delivery: &Delivery, outcome: DeliveryOutcome) -> Result<()> {
        match outcome {
            DeliveryOutcome::Ack => {
                self.consecutive_requeues = 0;
                self.source.ack(delivery).await?;
                self.telemetry.record_ack();
            }
            DeliveryOutcome::Reject => {
                self.consecutive_requeues = 0;
                self.source.reject(delivery).await?;
                self.telemetry.record_reject();
            }
            DeliveryOutcome::Requeue => {
                self.consecutive_requeues += 1;
                let delay = self
                    .config
                    .requeue_backoff()
                    .delay_for(self.consecutive_requeues);
                // Cancellation only shortens the wait; the delivery is still returned.
                let _ = sleep_with_cancellation(delay, Some(&self.shutdown)).await;
                self.source.requeue(delivery).await?;
                self.telemetry.record_requeue();
            }
            DeliveryOutcome::Ignore => self.telemetry.record_ignored(),
        }
        Ok(())
    }

    async fn distribute_epoch(&self, broadcast: &EpochBroadcast) -> Result<(), HandleError> {
        tracing::info!(
            begin = broadcast.begin,
            end = broadcast.end,
            broadcast_id = %broadcast.broadcast_id,
            "distributing epoch"
        );

        if let Err(err) = self.warmer.warm_up(broadcast.begin, broadcast.end).await {
            tracing::warn!(
                begin = broadcast.begin,
                end = broadcast.end,
                error = %err,
                "cache warm-up failed; continuing"
            );
        }

        let outbox = self.outbox.handle();
        let mut sent = 0u64;
        for project in self.config.projects() {
            let routing_key = self.topics.snapshot_process(&project.project_type);
            for contract in &project.projects {
                let message =
                    SnapshotProcessMessage::for_project(broadcast, &project.project_type, contract);
                outbox
                    .enqueue_json(routing_key.clone(), &message)
                    .await
                    .map_err(HandleError::Outbox)?;
                sent += 1;
                self.log_publish(&broadcast.broadcast_id, &routing_key, &message)
                    .await;
            }
        }

        self.telemetry.record_fan_out(sent);
        tracing::debug!(
            broadcast_id = %broadcast.broadcast_id,
            messages = sent,
            "epoch fanned out"
        );
        Ok(())
    }

    async fn route_finalized(&self, finalized: &SnapshotFinalizedMessage) -> Result<(), HandleError> {
        tracing::debug!(
            epoch_id = finalized.epoch_id,
            project_id = %finalized.project_id,
            "snapshot finalized"
        );

        let commit = PayloadCommitMessage {
            message: finalized.clone(),
            web3_storage: self.config.web3_storage(),
            source_chain_id: self.config.chain_id(),
        };
        self.outbox
            .handle()
            .enqueue_json(self.topics.commit_payload(), &commit)
            .await
            .map_err(HandleError::Outbox)?;
        self.telemetry.record_commit_forward();

        for aggregator in self.config.aggregators() {
            self.aggregate(aggregator, finalized).await?;
        }
        Ok(())
    }

    async fn aggregate(
        &self,
        aggregator: &AggregatorConfig,
        finalized: &SnapshotFinalizedMessage,
    ) -> Result<(), HandleError> {
        let project_type = aggregator.project_type.as_str();
        let routing_key = self.topics.calculate_aggregate(project_type);

        match &aggregator.mode {
            AggregationMode::SingleProject { filters } => {
                if !finalized.project_id.contains(&filters.project_id) {
                    tracing::debug!(
                        project_type,
                        project_id = %finalized.project_id,
                        "project does not match aggregator filter"
                    );
                    return Ok(());
                }
                self.outbox
                    .handle()
                    .enqueue_json(routing_key, finalized)
                    .await
                    .map_err(HandleError::Outbox)?;
                self.telemetry.record_aggregate();
            }
            AggregationMode::MultiProject {
                projects_to_wait_for,
            } => match self
                .tracker
                .record(project_type, projects_to_wait_for, finalized)
                .await?
            {
                JoinStatus::NotTracked => {
                    tracing::debug!(
                        project_type,
                        project_id = %finalized.project_id,
                        "project is not awaited by aggregator"
                    );
                }
                JoinStatus::Pending { missing } => {
                    tracing::info!(
                        project_type,
                        epoch_id = finalized.epoch_id,
                        missing,
                        "waiting for remaining projects"
                    );
                }
                JoinStatus::Complete(aggregate) => {
                    self.outbox
                        .handle()
                        .enqueue_json(routing_key.clone(), &aggregate)
                        .await
                        .map_err(HandleError::Outbox)?;
                    // The set is only cleared once the aggregate reached the broker.
                    self.flush_outbox().await?;
                    self.telemetry.record_aggregate();
                    self.log_publish(&aggregate.broadcast_id, &routing_key, &aggregate)
                        .await;
                    let cleared = self.tracker.clear(project_type, finalized.epoch_id).await?;
                    tracing::info!(
                        project_type,
                        epoch_id = finalized.epoch_id,
                        projects = aggregate.messages.len(),
                        cleared,
                        "aggregation complete"
                    );
                }
            },
        }
        Ok(())
    }

    /// Waits until the outbox has handed everything enqueued so far to the
    /// broker. Gives up when shutdown is requested first.
    async fn flush_outbox(&self) -> Result<(), HandleError> {
        let outbox = self.outbox.handle();
        tokio::select! {
            biased;
            flushed = outbox.flush() => flushed.map_err(HandleError::Outbox),
            _ = self.shutdown.cancelled() => Err(HandleError::Outbox(anyhow!(
                "shutdown requested before publishes were confirmed"
            ))),
        }
    }

    /// Appends a publish record to the broadcast's processing log. Failures
    /// are logged and otherwise ignored.
    async fn log_publish<T: Serialize>(&self, broadcast_id: &str, routing_key: &str, message: &T) {
        let entry = match serde_json::to_value(message).and_then(|msg| {
            serde_json::to_string(&ProcessingLogEntry {
                worker: self.config.worker_name().to_owned(),
                update: ProcessingUpdate {
                    action: PUBLISH_ACTION.to_owned(),
                    info: PublishInfo {
                        routing_key: routing_key.to_owned(),
                        msg,
                    },
                },
            })
        }) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(broadcast_id, error = %err, "failed to encode processing log entry");
                return;
            }
        };

        let key = self.keys.broadcast_processing_logs(broadcast_id);
        if let Err(err) = self.store.zadd(&key, &entry, unix_timestamp()).await {
            tracing::warn!(broadcast_id, error = %err, "failed to append processing log entry");
        }
    }
}

impl Component for ProcessorDistributor {
    fn name(&self) -> &'static str {
        "processor-distributor"
    }

    fn run(self: Box<Self>, ctx: ComponentContext) -> BoxFuture<'static, Result<()>> {
        Box::pin(ProcessorDistributor::run(*self, ctx))
    }
}
