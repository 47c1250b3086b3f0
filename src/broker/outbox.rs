//! Ordered publish queue drained by one background task.
//!
//! Producers enqueue without waiting for the broker; the task publishes in
//! enqueue order, retrying each message under the configured [`RetryPolicy`].
//! `flush` waits until everything enqueued before it has been handled and
//! fails if any of it was given up on. `drain` does the same before stopping
//! the task, abandoning whatever is still unpublished once the drain grace
//! period runs out.

use super::MessagePublisher;
use crate::runtime::retry::{retry_with_policy, RetryDisposition, RetryPolicy};
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

enum OutboxCommand {
    Publish { routing_key: String, body: Vec<u8> },
    /// Replies with the number of messages abandoned since the previous flush.
    Flush(oneshot::Sender<u64>),
    Shutdown(oneshot::Sender<()>),
}

/// Counts reported when the outbox stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutboxStats {
    pub published: u64,
    pub failed: u64,
}

/// Cloneable producer side of an [`Outbox`].
#[derive(Clone)]
pub struct OutboxHandle {
    sender: mpsc::Sender<OutboxCommand>,
}

impl OutboxHandle {
    pub async fn enqueue(&self, routing_key: impl Into<String>, body: Vec<u8>) -> Result<()> {
        self.sender
            .send(OutboxCommand::Publish {
                routing_key: routing_key.into(),
                body,
            })
            .await
            .map_err(|_| anyhow!("outbox is closed"))
    }

    pub async fn enqueue_json<T: Serialize>(
        &self,
        routing_key: impl Into<String>,
        message: &T,
    ) -> Result<()> {
        let body = serde_json::to_vec(message).context("failed to encode outgoing message")?;
        self.enqueue(routing_key, body).await
    }

    /// Waits until every message enqueued before this call was published or
    /// given up on. Fails if any message was given up on since the previous
    /// flush.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(OutboxCommand::Flush(done))
            .await
            .map_err(|_| anyhow!("outbox is closed"))?;
        let abandoned = wait
            .await
            .map_err(|_| anyhow!("outbox stopped before flushing"))?;
        if abandoned > 0 {
            bail!("{abandoned} message(s) could not be published");
        }
        Ok(())
    }
}

pub struct Outbox {
    handle: OutboxHandle,
    task: JoinHandle<OutboxStats>,
    abort: CancellationToken,
    drain_grace: Duration,
}

impl Outbox {
    pub fn spawn(
        publisher: Arc<dyn MessagePublisher>,
        policy: RetryPolicy,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self::with_capacity(publisher, policy, telemetry, DEFAULT_OUTBOX_CAPACITY)
    }

    pub fn with_capacity(
        publisher: Arc<dyn MessagePublisher>,
        policy: RetryPolicy,
        telemetry: Arc<Telemetry>,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let abort = CancellationToken::new();
        let task = tokio::spawn(run_outbox(
            receiver,
            publisher,
            policy,
            telemetry,
            abort.clone(),
        ));
        Self {
            handle: OutboxHandle { sender },
            task,
            abort,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// How long `drain` keeps retrying before abandoning what is left.
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn handle(&self) -> OutboxHandle {
        self.handle.clone()
    }

    /// Publishes everything already enqueued, then stops the background task.
    /// Once the drain grace period is over, pending retries are cancelled and
    /// the remaining messages are counted as failed. Enqueues made afterwards
    /// through outstanding handles fail.
    pub async fn drain(self) -> Result<OutboxStats> {
        let Outbox {
            handle,
            mut task,
            abort,
            drain_grace,
        } = self;

        let deadline = Instant::now() + drain_grace;
        let (done, _stopped) = oneshot::channel();
        let shutdown = handle.sender.send(OutboxCommand::Shutdown(done));
        let _ = timeout_at(deadline, shutdown).await;
        drop(handle);

        match timeout_at(deadline, &mut task).await {
            Ok(joined) => joined.context("outbox task panicked"),
            Err(_) => {
                tracing::warn!(
                    grace_ms = drain_grace.as_millis() as u64,
                    "outbox drain grace period elapsed; abandoning unpublished messages"
                );
                abort.cancel();
                task.await.context("outbox task panicked")
            }
        }
    }
}

async fn run_outbox(
    mut receiver: mpsc::Receiver<OutboxCommand>,
    publisher: Arc<dyn MessagePublisher>,
    policy: RetryPolicy,
    telemetry: Arc<Telemetry>,
    abort: CancellationToken,
) -> OutboxStats {
    let mut stats = OutboxStats::default();
    let mut abandoned = 0u64;
    let mut closed = false;

    loop {
        let command = tokio::select! {
            command = receiver.recv() => command,
            _ = abort.cancelled(), if !closed => {
                receiver.close();
                closed = true;
                continue;
            }
        };
        let Some(command) = command else { break };

        match command {
            OutboxCommand::Publish { routing_key, body } => {
                let target = publisher.as_ref();
                let (key, payload) = (routing_key.as_str(), body.as_slice());
                let result = retry_with_policy(
                    policy,
                    Some(&abort),
                    move |_| target.publish(key, payload),
                    |_| RetryDisposition::Retry,
                    |attempt, delay, err| {
                        tracing::warn!(
                            routing_key = %routing_key,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "publish failed; retrying"
                        );
                    },
                )
                .await;

                match result {
                    Ok(()) => {
                        stats.published += 1;
                        telemetry.record_published();
                    }
                    Err(err) => {
                        stats.failed += 1;
                        abandoned += 1;
                        telemetry.record_publish_failure();
                        tracing::error!(
                            routing_key = %routing_key,
                            error = %err,
                            "publish abandoned"
                        );
                    }
                }
            }
            OutboxCommand::Flush(done) => {
                let _ = done.send(abandoned);
                abandoned = 0;
            }
            OutboxCommand::Shutdown(done) => {
                receiver.close();
                closed = true;
                let _ = done.send(());
            }
        }
    }

    tracing::debug!(
        published = stats.published,
        failed = stats.failed,
        "outbox stopped"
    );
    stats
}
