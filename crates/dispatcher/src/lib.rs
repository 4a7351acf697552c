//! Outbound dispatcher — the worker pool that drains the OUTBOUND queue.
//!
//! Each worker runs the same loop: dequeue, claim the message row with a
//! status CAS, take rate-limiter tokens, render, send, and apply the
//! classified outcome. Idempotency rests on two legs: the row CAS (a
//! redelivered command whose message is already past `Queued` is dropped)
//! and the message id travelling as the upstream idempotency key.

mod backoff;
mod pool;
mod worker;

pub use backoff::compute_backoff;
pub use pool::WorkerPool;
pub use worker::{enqueue_command, DispatcherContext, Worker};

use std::time::Duration;

/// Dispatcher tuning, derived from `workers.*` and `retry.*` config.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub visibility_timeout: Duration,
    pub dequeue_wait: Duration,
    pub drain_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
    pub backoff_jitter: f64,
}

impl DispatcherSettings {
    pub fn from_config(config: &trunkline_core::AppConfig) -> Self {
        Self {
            visibility_timeout: Duration::from_secs(config.workers.visibility_timeout_secs),
            dequeue_wait: Duration::from_secs(config.workers.dequeue_wait_secs),
            drain_timeout: Duration::from_secs(config.workers.drain_timeout_secs),
            max_attempts: config.retry.max_attempts,
            backoff_base: Duration::from_millis(config.retry.backoff_base_ms),
            backoff_factor: config.retry.backoff_factor,
            backoff_cap: Duration::from_millis(config.retry.backoff_cap_ms),
            backoff_jitter: config.retry.backoff_jitter,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&trunkline_core::AppConfig::default())
    }
}
