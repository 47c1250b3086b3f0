//! Fixed-window rate limiting shared by every process that uses the same
//! store namespace.

pub mod limiter;
pub mod limits;

pub use limiter::{RateLimitError, RateLimiter, WindowStats, CLEAR_BATCH_SIZE};
pub use limits::{Granularity, RateLimit, RateLimitParseError};
