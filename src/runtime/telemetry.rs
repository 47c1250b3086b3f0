use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

pub const METRICS_TARGET: &str = "epochcast::metrics";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Monotonic counters shared by every component of a process.
#[derive(Default, Debug)]
pub struct Telemetry {
    epochs_broadcast: AtomicU64,
    checkpoint_write_failures: AtomicU64,
    epoch_source_errors: AtomicU64,
    deliveries_acked: AtomicU64,
    deliveries_rejected: AtomicU64,
    deliveries_requeued: AtomicU64,
    deliveries_ignored: AtomicU64,
    fan_out_messages: AtomicU64,
    commit_forwards: AtomicU64,
    aggregates_emitted: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    rate_limit_rejections: AtomicU64,
    rate_limit_fail_opens: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Telemetry {
    counter!(record_epoch_broadcast, epochs_broadcast);
    counter!(record_checkpoint_write_failure, checkpoint_write_failures);
    counter!(record_epoch_source_error, epoch_source_errors);
    counter!(record_ack, deliveries_acked);
    counter!(record_reject, deliveries_rejected);
    counter!(record_requeue, deliveries_requeued);
    counter!(record_ignored, deliveries_ignored);
    counter!(record_commit_forward, commit_forwards);
    counter!(record_aggregate, aggregates_emitted);
    counter!(record_published, messages_published);
    counter!(record_publish_failure, publish_failures);
    counter!(record_rate_limit_rejection, rate_limit_rejections);
    counter!(record_rate_limit_fail_open, rate_limit_fail_opens);

    pub fn record_fan_out(&self, messages: u64) {
        if messages == 0 {
            return;
        }
        self.fan_out_messages.fetch_add(messages, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            epochs_broadcast: self.epochs_broadcast.load(Ordering::Relaxed),
            checkpoint_write_failures: self.checkpoint_write_failures.load(Ordering::Relaxed),
            epoch_source_errors: self.epoch_source_errors.load(Ordering::Relaxed),
            deliveries_acked: self.deliveries_acked.load(Ordering::Relaxed),
            deliveries_rejected: self.deliveries_rejected.load(Ordering::Relaxed),
            deliveries_requeued: self.deliveries_requeued.load(Ordering::Relaxed),
            deliveries_ignored: self.deliveries_ignored.load(Ordering::Relaxed),
            fan_out_messages: self.fan_out_messages.load(Ordering::Relaxed),
            commit_forwards: self.commit_forwards.load(Ordering::Relaxed),
            aggregates_emitted: self.aggregates_emitted.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
            rate_limit_fail_opens: self.rate_limit_fail_opens.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub epochs_broadcast: u64,
    pub checkpoint_write_failures: u64,
    pub epoch_source_errors: u64,
    pub deliveries_acked: u64,
    pub deliveries_rejected: u64,
    pub deliveries_requeued: u64,
    pub deliveries_ignored: u64,
    pub fan_out_messages: u64,
    pub commit_forwards: u64,
    pub aggregates_emitted: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub rate_limit_rejections: u64,
    pub rate_limit_fail_opens: u64,
}

impl TelemetrySnapshot {
    pub fn deliveries_settled(&self) -> u64 {
        self.deliveries_acked + self.deliveries_rejected + self.deliveries_requeued
    }
}

/// Spawns a background task that periodically logs counters and delivery throughput.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: METRICS_TARGET, "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let settled_delta = current
                        .deliveries_settled()
                        .saturating_sub(last_snapshot.deliveries_settled());
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        settled_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: METRICS_TARGET,
                        deliveries_per_sec = format!("{throughput:.2}"),
                        epochs_broadcast = current.epochs_broadcast,
                        checkpoint_write_failures = current.checkpoint_write_failures,
                        epoch_source_errors = current.epoch_source_errors,
                        acked = current.deliveries_acked,
                        rejected = current.deliveries_rejected,
                        requeued = current.deliveries_requeued,
                        ignored = current.deliveries_ignored,
                        fan_out = current.fan_out_messages,
                        commit_forwards = current.commit_forwards,
                        aggregates = current.aggregates_emitted,
                        published = current.messages_published,
                        publish_failures = current.publish_failures,
                        rate_limited = current.rate_limit_rejections,
                        rate_limit_fail_opens = current.rate_limit_fail_opens,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
