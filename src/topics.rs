//! Routing keys used on the broker, derived from the deployment identity, plus
//! AMQP-style topic pattern matching shared by the broker backends.

pub const EPOCH_RELEASED: &str = "EpochReleased";
pub const SNAPSHOT_FINALIZED: &str = "SnapshotFinalized";

/// Builds every routing key for one `(namespace, instance_id)` deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
    instance_id: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            instance_id: instance_id.into(),
        }
    }

    fn events_prefix(&self) -> String {
        format!("epoch-events:{}:{}", self.namespace, self.instance_id)
    }

    /// Key the epoch detector publishes broadcasts on.
    pub fn epoch_released(&self) -> String {
        format!("{}.{EPOCH_RELEASED}", self.events_prefix())
    }

    /// Key snapshot workers report completions on.
    pub fn snapshot_finalized(&self) -> String {
        format!("{}.{SNAPSHOT_FINALIZED}", self.events_prefix())
    }

    /// Binding pattern of the distributor's inbound queue.
    pub fn inbound_binding(&self) -> String {
        format!("{}.*", self.events_prefix())
    }

    pub fn snapshot_process(&self, project_type: &str) -> String {
        format!(
            "backend-callback:{}:{}:{EPOCH_RELEASED}.{project_type}",
            self.namespace, self.instance_id
        )
    }

    pub fn calculate_aggregate(&self, project_type: &str) -> String {
        format!(
            "backend-callback:{}:{}:CalculateAggregate.{project_type}",
            self.namespace, self.instance_id
        )
    }

    pub fn commit_payload(&self) -> String {
        format!(
            "backend-commit-payload:{}:{}.Finalized",
            self.namespace, self.instance_id
        )
    }
}

/// Event type carried by a routing key: the text after its last `.`.
pub fn event_suffix(routing_key: &str) -> &str {
    routing_key
        .rsplit_once('.')
        .map(|(_, suffix)| suffix)
        .unwrap_or(routing_key)
}

/// AMQP topic matching: words split on `.`, `*` matches exactly one word and
/// `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_namespaced_routing_keys() {
        let topics = Topics::new("uniswap", "node-1");
        assert_eq!(
            topics.epoch_released(),
            "epoch-events:uniswap:node-1.EpochReleased"
        );
        assert_eq!(
            topics.snapshot_process("pair_reserves"),
            "backend-callback:uniswap:node-1:EpochReleased.pair_reserves"
        );
        assert_eq!(
            topics.calculate_aggregate("volume_24h"),
            "backend-callback:uniswap:node-1:CalculateAggregate.volume_24h"
        );
        assert_eq!(
            topics.commit_payload(),
            "backend-commit-payload:uniswap:node-1.Finalized"
        );
    }

    #[test]
    fn inbound_binding_covers_both_event_types() {
        let topics = Topics::new("ns", "id");
        let binding = topics.inbound_binding();
        assert!(topic_matches(&binding, &topics.epoch_released()));
        assert!(topic_matches(&binding, &topics.snapshot_finalized()));
        assert!(!topic_matches(&binding, &topics.commit_payload()));
        assert!(!topic_matches(&binding, &topics.snapshot_process("pairs")));
    }

    #[test]
    fn topic_wildcards_follow_amqp_rules() {
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#.c", "a.b.c"));
        assert!(topic_matches("a.*.c", "a.b.c"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(!topic_matches("a.*", "a"));
        assert!(topic_matches("#", ""));
    }

    #[test]
    fn event_suffix_takes_last_segment() {
        assert_eq!(event_suffix("x:y:z.SnapshotFinalized"), SNAPSHOT_FINALIZED);
        assert_eq!(event_suffix("a.b.EpochReleased"), EPOCH_RELEASED);
        assert_eq!(event_suffix("plain"), "plain");
    }
}
