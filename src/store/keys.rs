//! Key layout in the shared store. Each namespace has exactly one writer role:
//! the detector owns the checkpoint, the distributor owns processing logs and
//! correlation sets, the rate limiter owns buckets.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    namespace: String,
}

impl StoreKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn last_processed_epoch(&self) -> String {
        format!("{}:lastProcessedEpoch", self.namespace)
    }

    pub fn broadcast_processing_logs(&self, broadcast_id: &str) -> String {
        format!("{}:broadcastProcessingLogs:{broadcast_id}", self.namespace)
    }

    pub fn aggregator_events(&self, project_type: &str) -> String {
        format!("{}:aggregator:{project_type}:events", self.namespace)
    }

    pub fn rate_limit_prefix(&self) -> String {
        format!("{}:rateLimit:", self.namespace)
    }

    pub fn rate_limit_bucket(&self, identity: &str, window: &str) -> String {
        format!("{}{identity}:{window}", self.rate_limit_prefix())
    }
}
