//! Redis-backed shared buckets for multi-node deployments.
//!
//! The bucket state (tokens, last refill) lives in a Redis hash per phone
//! number; refill-and-take runs as a single Lua script so concurrent
//! dispatcher processes see an atomic compare-and-swap.

use std::time::Duration;

use crate::Decision;

/// Lua token bucket: refill by elapsed time, take one token if available,
/// otherwise report the wait in milliseconds. KEYS[1] = bucket key,
/// ARGV = [capacity, refill_rate_per_sec, now_ms, ttl_secs].
const TAKE_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil then
  tokens = capacity
  ts = now_ms
end

local elapsed = (now_ms - ts) / 1000.0
if elapsed > 0 then
  tokens = math.min(capacity, tokens + elapsed * rate)
end

local wait_ms = 0
if tokens >= 1 then
  tokens = tokens - 1
else
  wait_ms = math.ceil((1 - tokens) / rate * 1000)
end

redis.call('HMSET', key, 'tokens', tokens, 'ts', now_ms)
redis.call('EXPIRE', key, ttl)
return wait_ms
"#;

/// Shared token buckets realized in Redis.
pub struct SharedBuckets {
    client: redis::Client,
    capacity: u64,
    refill_rate: u64,
}

impl SharedBuckets {
    pub fn new(url: &str, capacity: u64, refill_rate: u64) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            capacity,
            refill_rate,
        })
    }

    /// Atomically refill-and-take one token for `phone_number_id`.
    pub async fn acquire(&self, phone_number_id: &str) -> Result<Decision, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = format!("limiter:number:{phone_number_id}");
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let script = redis::Script::new(TAKE_SCRIPT);
        let wait_ms: u64 = script
            .key(&key)
            .arg(self.capacity)
            .arg(self.refill_rate)
            .arg(now_ms)
            // Idle buckets expire after a minute of full refill headroom.
            .arg(60)
            .invoke_async(&mut conn)
            .await?;

        if wait_ms == 0 {
            Ok(Decision::Granted)
        } else {
            Ok(Decision::Wait(Duration::from_millis(wait_ms)))
        }
    }
}
