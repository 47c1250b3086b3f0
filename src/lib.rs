pub mod broker;
pub mod detector;
pub mod distributor;
pub mod messages;
pub mod ratelimit;
pub mod runtime;
pub mod store;
pub mod topics;

pub use broker::{
    Delivery, DeliverySource, MemoryBroker, MessagePublisher, Outbox, OutboxHandle, RedisBroker,
};
pub use detector::{
    chunks, DetectorError, EpochDetector, EpochSource, EpochSourceError, HttpEpochSource,
    PollOutcome,
};
pub use distributor::{
    AggregationTracker, CacheWarmer, DeliveryOutcome, InboundMessage, JoinStatus,
    NoopCacheWarmer, ProcessorDistributor,
};
pub use messages::{
    AggregateMessage, Epoch, EpochBroadcast, PayloadCommitMessage, SnapshotFinalizedMessage,
    SnapshotProcessMessage,
};
pub use ratelimit::{RateLimit, RateLimitError, RateLimiter};
pub use runtime::config::{
    AggregationMode, AggregatorConfig, DetectorConfig, DistributorConfig, FallBehindPolicy,
    Settings,
};
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::retry::RetryPolicy;
pub use runtime::runner::{Component, ComponentContext, Runner};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{KeyValueStore, MemoryStore, RedisStore, StoreError, StoreKeys};
pub use topics::Topics;
