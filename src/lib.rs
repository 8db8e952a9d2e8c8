//! Bounded worker pool with cancellable jobs.
//!
//! # Features
//! - Fixed number of worker threads consuming a bounded FIFO queue
//! - Per-job cancellation with a single, race-free commit point
//! - Pool-wide cancel/close that drains queued jobs, and reset for reuse
//! - Panic isolation: a panicking job gets a recovery error and its worker is replaced
//! - Blocking and async waiting on job completion

pub mod errors;
pub mod handle;
pub mod logging;
pub mod model;
pub mod pool;
mod worker;

pub use errors::{BoxError, ConfigError, JobError};
pub use handle::Job;
pub use model::{Config, PoolMetrics};
pub use pool::Pool;
pub use worker::MAX_STACK_TRACE_BYTES;
