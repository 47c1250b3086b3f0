//! Runtime glue: configuration, retry policy, fatal-error handling,
//! telemetry, and runner orchestration.

pub mod config;
pub mod fatal;
pub mod retry;
pub mod runner;
pub mod telemetry;
