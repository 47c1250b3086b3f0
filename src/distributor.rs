//! Processor distribution: fans released epochs out to snapshot workers and
//! routes their completion reports to the commit and aggregation stages.

pub mod aggregation;
pub mod router;
pub mod service;
pub mod warmup;

pub use aggregation::{AggregationTracker, JoinStatus};
pub use router::{decode, DecodeError, InboundMessage};
pub use service::{DeliveryOutcome, ProcessorDistributor};
pub use warmup::{CacheWarmer, NoopCacheWarmer};
