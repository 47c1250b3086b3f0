//! Topic-routed, acknowledgement-gated message transport.
//!
//! Publishers address messages by routing key; consumers receive them from a
//! queue bound to one or more topic patterns and must settle every delivery by
//! acking, rejecting, or requeueing it. Delivery is at-least-once.

pub mod memory;
pub mod outbox;
pub mod redis;

use anyhow::Result;
use futures::future::BoxFuture;

pub use memory::MemoryBroker;
pub use outbox::{Outbox, OutboxHandle};
pub use self::redis::RedisBroker;

/// A message taken off a queue and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Opaque backend token identifying this delivery when settling it.
    pub receipt: String,
}

pub trait MessagePublisher: Send + Sync {
    fn publish<'a>(&'a self, routing_key: &'a str, body: &'a [u8]) -> BoxFuture<'a, Result<()>>;
}

pub trait DeliverySource: Send + Sync {
    /// Waits for the next delivery. `Ok(None)` means the source is closed.
    fn next_delivery(&self) -> BoxFuture<'_, Result<Option<Delivery>>>;

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>>;

    /// Drops the delivery without returning it to the queue.
    fn reject<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>>;

    /// Returns the delivery to the queue for redelivery.
    fn requeue<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>>;
}
