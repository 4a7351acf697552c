//! Token-bucket rate limiting for outbound sends.
//!
//! Three layers of buckets: per phone number, per workspace, and one global
//! bucket for the process. Callers must win all three; on contention the
//! limiter hands back a wait hint instead of blocking. Buckets live in a
//! DashMap for single-node deployments, or in Redis (atomic Lua script)
//! when several dispatcher processes share the allowance.

mod bucket;
mod shared;

pub use bucket::TokenBucket;
pub use shared::SharedBuckets;

use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of an `acquire` call. The limiter never fails: at worst the
/// caller is told how long to back off before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    Wait(Duration),
}

impl Decision {
    pub fn wait_hint(&self) -> Option<Duration> {
        match self {
            Decision::Granted => None,
            Decision::Wait(d) => Some(*d),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterRates {
    pub per_number: u64,
    pub per_workspace: u64,
    pub global: u64,
}

impl From<&trunkline_core::config::LimiterConfig> for LimiterRates {
    fn from(config: &trunkline_core::config::LimiterConfig) -> Self {
        Self {
            per_number: config.per_number_rate,
            per_workspace: config.workspace_rate,
            global: config.global_rate,
        }
    }
}

/// Process-wide rate limiter over phone-number, workspace and global
/// token buckets.
pub struct RateLimiter {
    rates: LimiterRates,
    number_buckets: DashMap<String, TokenBucket>,
    workspace_buckets: DashMap<Uuid, TokenBucket>,
    global_bucket: std::sync::Mutex<TokenBucket>,
    /// Per-number capacity overrides derived from quality/tier updates.
    number_overrides: DashMap<String, u64>,
    shared: Option<SharedBuckets>,
}

impl RateLimiter {
    pub fn new(rates: LimiterRates) -> Self {
        Self {
            rates,
            number_buckets: DashMap::new(),
            workspace_buckets: DashMap::new(),
            global_bucket: std::sync::Mutex::new(TokenBucket::new(
                rates.global as f64,
                rates.global as f64,
            )),
            number_overrides: DashMap::new(),
            shared: None,
        }
    }

    /// Attach a Redis-backed shared bucket layer for multi-node deployments.
    pub fn with_shared(mut self, shared: SharedBuckets) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Override the refill rate for one phone number (e.g. after a quality
    /// rating downgrade). Takes effect on the next acquire.
    pub fn set_number_rate(&self, phone_number_id: &str, rate: u64) {
        self.number_overrides
            .insert(phone_number_id.to_string(), rate);
        self.number_buckets.remove(phone_number_id);
    }

    fn number_rate(&self, phone_number_id: &str) -> u64 {
        self.number_overrides
            .get(phone_number_id)
            .map(|r| *r)
            .unwrap_or(self.rates.per_number)
            .max(1)
    }

    /// Try to take one token from each of the three buckets. Partial
    /// acquisitions are rolled back so a contended bucket never leaks
    /// tokens from the others.
    pub async fn acquire(&self, phone_number_id: &str, workspace_id: Uuid) -> Decision {
        // Shared layer first: if another node drained the allowance there is
        // no point consuming local tokens.
        if let Some(shared) = &self.shared {
            match shared.acquire(phone_number_id).await {
                Ok(Decision::Granted) => {}
                Ok(Decision::Wait(hint)) => {
                    metrics::counter!("limiter.shared_throttled").increment(1);
                    return Decision::Wait(hint);
                }
                Err(e) => {
                    // Fall open to the local bucket, degraded but available.
                    warn!(error = %e, "Shared limiter unreachable, falling open to local buckets");
                    metrics::counter!("limiter.shared_fallback").increment(1);
                }
            }
        }

        let number_rate = self.number_rate(phone_number_id) as f64;
        let mut number = self
            .number_buckets
            .entry(phone_number_id.to_string())
            .or_insert_with(|| TokenBucket::new(number_rate, number_rate));
        if let Some(hint) = number.try_acquire() {
            metrics::counter!("limiter.number_throttled").increment(1);
            debug!(phone_number_id, wait_ms = hint.as_millis() as u64, "Per-number bucket empty");
            return Decision::Wait(hint);
        }
        drop(number);

        let ws_rate = self.rates.per_workspace as f64;
        let mut workspace = self
            .workspace_buckets
            .entry(workspace_id)
            .or_insert_with(|| TokenBucket::new(ws_rate, ws_rate));
        if let Some(hint) = workspace.try_acquire() {
            self.restore_number(phone_number_id);
            metrics::counter!("limiter.workspace_throttled").increment(1);
            return Decision::Wait(hint);
        }
        drop(workspace);

        let mut global = self.global_bucket.lock().expect("limiter mutex poisoned");
        if let Some(hint) = global.try_acquire() {
            drop(global);
            self.restore_number(phone_number_id);
            self.restore_workspace(workspace_id);
            metrics::counter!("limiter.global_throttled").increment(1);
            return Decision::Wait(hint);
        }

        Decision::Granted
    }

    /// Feed an upstream 429 back into the per-number bucket: drain it and
    /// defer the next refill by the upstream-provided duration.
    pub fn penalize(&self, phone_number_id: &str, retry_after: Duration) {
        if let Some(mut bucket) = self.number_buckets.get_mut(phone_number_id) {
            bucket.penalize(retry_after);
        } else {
            let rate = self.number_rate(phone_number_id) as f64;
            let mut bucket = TokenBucket::new(rate, rate);
            bucket.penalize(retry_after);
            self.number_buckets
                .insert(phone_number_id.to_string(), bucket);
        }
        metrics::counter!("limiter.penalized").increment(1);
    }

    fn restore_number(&self, phone_number_id: &str) {
        if let Some(mut bucket) = self.number_buckets.get_mut(phone_number_id) {
            bucket.give_back(1.0);
        }
    }

    fn restore_workspace(&self, workspace_id: Uuid) {
        if let Some(mut bucket) = self.workspace_buckets.get_mut(&workspace_id) {
            bucket.give_back(1.0);
        }
    }
}
