//! Flow-control primitives shared by outbound calls and batch jobs.
//!
//! - [`retry_with_backoff`]: exponential backoff with ±25% jitter
//! - [`classify_error`] / [`is_retryable_error`]: message-based error classification
//! - [`Semaphore`]: FIFO permit pool
//! - [`ConcurrencyPool`], [`process_with_concurrency`], [`process_settled`]: bounded fan-out

pub mod classify;
pub mod pool;
pub mod retry;
pub mod semaphore;

pub use classify::{ErrorClass, classify_error, is_retryable_error};
pub use pool::{BatchReport, ConcurrencyPool, Progress, process_settled, process_with_concurrency};
pub use retry::{RetryConfig, RetryOutcome, retry_with_backoff};
pub use semaphore::{Permit, Semaphore};
