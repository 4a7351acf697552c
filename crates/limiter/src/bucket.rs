//! Classic token bucket with lazy refill on a monotonic clock.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    /// Refill is suspended until this point after an upstream penalty.
    frozen_until: Option<Instant>,
}

impl TokenBucket {
    /// New bucket, starting full.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
            frozen_until: None,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        if let Some(until) = self.frozen_until {
            if now < until {
                return;
            }
            self.frozen_until = None;
            self.last_refill = now;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token. Returns `None` on success, or the duration to wait
    /// until a token becomes available.
    pub fn try_acquire(&mut self) -> Option<Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return None;
        }
        Some(self.wait_time())
    }

    /// Duration until one token will be available, assuming no other taker.
    pub fn wait_time(&self) -> Duration {
        let mut wait = Duration::ZERO;
        let now = Instant::now();
        if let Some(until) = self.frozen_until {
            if until > now {
                wait = until.duration_since(now);
            }
        }
        if self.tokens < 1.0 && self.refill_rate > 0.0 {
            let needed = (1.0 - self.tokens) / self.refill_rate;
            wait += Duration::from_secs_f64(needed);
        }
        wait
    }

    /// Return tokens taken by a partially-failed multi-bucket acquire.
    pub fn give_back(&mut self, count: f64) {
        self.tokens = (self.tokens + count).min(self.capacity);
    }

    /// Drain the bucket and suspend refill for `duration`. Used when the
    /// upstream reports a rate limit with a Retry-After.
    pub fn penalize(&mut self, duration: Duration) {
        self.tokens = 0.0;
        self.frozen_until = Some(Instant::now() + duration);
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}
