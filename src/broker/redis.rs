//! Broker over Redis lists.
//!
//! Bindings live in a shared set so publishers in other processes see them.
//! A publish pushes one envelope onto every queue whose binding pattern matches
//! the routing key. Consumers move envelopes atomically into `<queue>:processing`
//! and settle them from there; rejected envelopes land in `<queue>:dead`.

use super::{Delivery, DeliverySource, MessagePublisher};
use crate::topics::topic_matches;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_BINDINGS_KEY: &str = "epochcast:bindings";
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    routing_key: String,
    body: String,
}

#[derive(Clone)]
pub struct RedisBroker {
    publisher: ConnectionManager,
    consumer: ConnectionManager,
    bindings_key: String,
    queue: String,
    block_timeout: Duration,
    shutdown: CancellationToken,
}

impl RedisBroker {
    /// Connects a broker consuming from `queue`. Publishing and blocking
    /// consumption use separate connections.
    pub async fn connect(url: &str, queue: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .context("failed to open broker publish connection")?;
        let consumer = ConnectionManager::new(client)
            .await
            .context("failed to open broker consume connection")?;
        Ok(Self {
            publisher,
            consumer,
            bindings_key: DEFAULT_BINDINGS_KEY.to_owned(),
            queue: queue.into(),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.queue)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.queue)
    }

    /// Routes messages whose key matches `pattern` into this broker's queue.
    pub async fn bind(&self, pattern: &str) -> Result<()> {
        let member = serde_json::to_string(&Binding {
            queue: self.queue.clone(),
            pattern: pattern.to_owned(),
        })?;
        let mut conn = self.publisher.clone();
        let _: () = conn
            .sadd(&self.bindings_key, member)
            .await
            .with_context(|| format!("failed to bind {pattern} to {}", self.queue))?;
        tracing::info!(queue = %self.queue, pattern, "queue bound");
        Ok(())
    }

    /// Returns envelopes left in the processing list by a crashed consumer to
    /// the head of the queue. Call once at startup before consuming.
    pub async fn recover_in_flight(&self) -> Result<usize> {
        let processing = self.processing_key();
        let mut conn = self.consumer.clone();
        let mut recovered = 0usize;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&processing)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await
                .context("failed to recover in-flight deliveries")?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!(queue = %self.queue, recovered, "requeued in-flight deliveries");
        }
        Ok(recovered)
    }

    /// Makes a pending or future `next_delivery` return `Ok(None)`.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn bound_queues(&self, routing_key: &str) -> Result<Vec<String>> {
        let mut conn = self.publisher.clone();
        let members: Vec<String> = conn
            .smembers(&self.bindings_key)
            .await
            .context("failed to load queue bindings")?;
        let mut queues: Vec<String> = members
            .iter()
            .filter_map(|raw| serde_json::from_str::<Binding>(raw).ok())
            .filter(|binding| topic_matches(&binding.pattern, routing_key))
            .map(|binding| binding.queue)
            .collect();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    async fn publish_now(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let body = String::from_utf8(body.to_vec()).context("message body is not utf-8")?;
        let envelope = serde_json::to_string(&Envelope {
            routing_key: routing_key.to_owned(),
            body,
        })?;
        let queues = self.bound_queues(routing_key).await?;
        if queues.is_empty() {
            tracing::debug!(routing_key, "no queue bound; message dropped");
            return Ok(());
        }
        let mut conn = self.publisher.clone();
        let _: () = push_to_queues(&queues, &envelope)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to push to {}", queues.join(", ")))?;
        Ok(())
    }

    async fn blocking_move(&self) -> Result<Option<String>> {
        let mut conn = self.consumer.clone();
        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(self.processing_key())
            .arg("LEFT")
            .arg("RIGHT")
            .arg(self.block_timeout.as_secs())
            .query_async(&mut conn)
            .await
            .context("failed to take delivery")?;
        Ok(moved)
    }

    async fn next_now(&self) -> Result<Option<Delivery>> {
        loop {
            let raw = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                moved = self.blocking_move() => moved?,
            };
            let Some(raw) = raw else {
                continue;
            };
            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => {
                    return Ok(Some(Delivery {
                        routing_key: envelope.routing_key,
                        body: envelope.body.into_bytes(),
                        receipt: raw,
                    }))
                }
                Err(err) => {
                    tracing::error!(queue = %self.queue, error = %err, "undecodable envelope dead-lettered");
                    self.move_out_of_processing(&raw, &self.dead_key(), false)
                        .await?;
                }
            }
        }
    }

    async fn move_out_of_processing(&self, receipt: &str, target: &str, front: bool) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().lrem(self.processing_key(), 1, receipt).ignore();
        if front {
            pipe.lpush(target, receipt).ignore();
        } else {
            pipe.rpush(target, receipt).ignore();
        }
        let mut conn = self.publisher.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to move delivery to {target}"))?;
        Ok(())
    }
}

/// Appends `envelope` to every queue inside one MULTI/EXEC block.
fn push_to_queues(queues: &[String], envelope: &str) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for queue in queues {
        pipe.rpush(queue, envelope).ignore();
    }
    pipe
}

impl MessagePublisher for RedisBroker {
    fn publish<'a>(&'a self, routing_key: &'a str, body: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.publish_now(routing_key, body))
    }
}

impl DeliverySource for RedisBroker {
    fn next_delivery(&self) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(self.next_now())
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.publisher.clone();
            let _: () = conn
                .lrem(self.processing_key(), 1, &delivery.receipt)
                .await
                .context("failed to ack delivery")?;
            Ok(())
        })
    }

    fn reject<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let dead = self.dead_key();
            self.move_out_of_processing(&delivery.receipt, &dead, false)
                .await
        })
    }

    fn requeue<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.move_out_of_processing(&delivery.receipt, &self.queue, true)
                .await
        })
    }
}
