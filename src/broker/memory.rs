//! In-process broker with a single consumer queue. Used by tests and by
//! single-process deployments that wire the detector straight into the
//! distributor.

use super::{Delivery, DeliverySource, MessagePublisher};
use crate::topics::topic_matches;
use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BrokerInner {
    bindings: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    queue: VecDeque<Delivery>,
    in_flight: HashMap<String, Delivery>,
    rejected: Vec<Delivery>,
    acked: usize,
    next_receipt: u64,
    failing_publishes: usize,
    closed: bool,
}

impl BrokerInner {
    fn enqueue(&mut self, routing_key: &str, body: &[u8]) {
        self.next_receipt += 1;
        self.queue.push_back(Delivery {
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            receipt: format!("mem-{}", self.next_receipt),
        });
    }

    fn take_in_flight(&mut self, delivery: &Delivery) -> Result<Delivery> {
        self.in_flight
            .remove(&delivery.receipt)
            .ok_or_else(|| anyhow!("delivery {} is not in flight", delivery.receipt))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    inner: Mutex<BrokerInner>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes future publishes whose key matches `pattern` into the consumer
    /// queue.
    pub fn bind(&self, pattern: impl Into<String>) {
        self.lock().bindings.push(pattern.into());
    }

    /// Places a message straight onto the consumer queue, bypassing bindings.
    pub fn inject(&self, routing_key: &str, body: impl AsRef<[u8]>) {
        self.lock().enqueue(routing_key, body.as_ref());
        self.notify.notify_one();
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().failing_publishes = count;
    }

    /// Closes the consumer side once the queue is empty.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Decodes every message published to `routing_key`.
    pub fn published_json<T: DeserializeOwned>(&self, routing_key: &str) -> Result<Vec<T>> {
        self.published_to(routing_key)
            .iter()
            .map(|body| serde_json::from_slice(body).map_err(Into::into))
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn acked_count(&self) -> usize {
        self.lock().acked
    }

    pub fn rejected(&self) -> Vec<Delivery> {
        self.lock().rejected.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_now(&self, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing_publishes > 0 {
            inner.failing_publishes -= 1;
            bail!("broker refused publish to {routing_key}");
        }
        inner.published.push((routing_key.to_owned(), body.to_vec()));
        let routed = inner
            .bindings
            .iter()
            .any(|pattern| topic_matches(pattern, routing_key));
        if routed {
            inner.enqueue(routing_key, body);
        }
        drop(inner);
        if routed {
            self.notify.notify_one();
        }
        Ok(())
    }

    fn try_next(&self) -> Option<Option<Delivery>> {
        let mut inner = self.lock();
        if let Some(delivery) = inner.queue.pop_front() {
            inner
                .in_flight
                .insert(delivery.receipt.clone(), delivery.clone());
            return Some(Some(delivery));
        }
        inner.closed.then_some(None)
    }
}

impl MessagePublisher for MemoryBroker {
    fn publish<'a>(&'a self, routing_key: &'a str, body: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.publish_now(routing_key, body) })
    }
}

impl DeliverySource for MemoryBroker {
    fn next_delivery(&self) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move {
            loop {
                if let Some(next) = self.try_next() {
                    return Ok(next);
                }
                self.notify.notified().await;
            }
        })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.take_in_flight(delivery)?;
            inner.acked += 1;
            Ok(())
        })
    }

    fn reject<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let delivery = inner.take_in_flight(delivery)?;
            inner.rejected.push(delivery);
            Ok(())
        })
    }

    fn requeue<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            let delivery = inner.take_in_flight(delivery)?;
            inner.queue.push_front(delivery);
            drop(inner);
            self.notify.notify_one();
            Ok(())
        })
    }
}
