//! Epoch detection: polls the epoch authority, splits any new block range into
//! epochs, broadcasts them in order, and checkpoints the last one.

pub mod chunks;
pub mod service;
pub mod source;

pub use chunks::{chunks, EpochChunks};
pub use service::{DetectorError, EpochDetector, PollOutcome};
pub use source::{EpochSource, EpochSourceError, HttpEpochSource, EPOCH_AUTHORITY_IDENTITY};
