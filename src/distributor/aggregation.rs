//! Multi-project join: collects finalized snapshots per epoch in a sorted set
//! scored by epoch id until every awaited project has reported.

use crate::messages::{AggregateMessage, SnapshotFinalizedMessage};
use crate::store::{KeyValueStore, StoreError, StoreKeys};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinStatus {
    /// The message's project is not one this aggregator waits for.
    NotTracked,
    /// Recorded; `missing` awaited projects have not reported for the epoch.
    Pending { missing: usize },
    /// Every awaited project reported. The caller publishes the aggregate and
    /// then clears the epoch.
    Complete(AggregateMessage),
}

#[derive(Clone)]
pub struct AggregationTracker {
    store: Arc<dyn KeyValueStore>,
    keys: StoreKeys,
}

impl AggregationTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, keys: StoreKeys) -> Self {
        Self { store, keys }
    }

    /// Adds `message` to the epoch's correlation set and checks whether the
    /// set now holds exactly the projects in `required`.
    pub async fn record(
        &self,
        project_type: &str,
        required: &[String],
        message: &SnapshotFinalizedMessage,
    ) -> Result<JoinStatus, StoreError> {
        if !required.iter().any(|project| *project == message.project_id) {
            return Ok(JoinStatus::NotTracked);
        }

        let key = self.keys.aggregator_events(project_type);
        let member = serde_json::to_string(message).map_err(|err| StoreError::Command {
            operation: "zadd",
            reason: format!("failed to encode member: {err}"),
        })?;
        self.store.zadd(&key, &member, message.epoch_id).await?;

        let members = self
            .store
            .zrange_by_score(&key, message.epoch_id, message.epoch_id)
            .await?;

        let mut latest: HashMap<String, SnapshotFinalizedMessage> = HashMap::new();
        for raw in &members {
            let event: SnapshotFinalizedMessage = match serde_json::from_str(raw) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(
                        project_type,
                        epoch_id = message.epoch_id,
                        error = %err,
                        "skipping undecodable correlation entry"
                    );
                    continue;
                }
            };
            let replace = latest
                .get(&event.project_id)
                .map_or(true, |current| event.timestamp > current.timestamp);
            if replace {
                latest.insert(event.project_id.clone(), event);
            }
        }

        let present: HashSet<&str> = latest.keys().map(String::as_str).collect();
        let awaited: HashSet<&str> = required.iter().map(String::as_str).collect();
        if present != awaited {
            let missing = awaited.difference(&present).count();
            return Ok(JoinStatus::Pending { missing });
        }

        let messages = required
            .iter()
            .filter_map(|project| latest.remove(project))
            .collect();
        Ok(JoinStatus::Complete(AggregateMessage::new(messages)))
    }

    /// Removes every correlation entry recorded for `epoch_id`.
    pub async fn clear(&self, project_type: &str, epoch_id: u64) -> Result<u64, StoreError> {
        let key = self.keys.aggregator_events(project_type);
        self.store.zrem_range_by_score(&key, epoch_id, epoch_id).await
    }
}
