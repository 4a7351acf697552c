//! Redis-backed queue for multi-process deployments.
//!
//! Layout per queue `name`:
//!   `{name}:ready`    — LIST of serialized envelopes, LPUSH/RPOP
//!   `{name}:delayed`  — ZSET scored by due time (ms since epoch)
//!   `{name}:inflight` — ZSET scored by visibility deadline (ms)
//!
//! Envelopes carry a receipt and a delivery counter so redeliveries are
//! observable. Promotion of due delayed items and reclaim of expired
//! in-flight items piggyback on `dequeue`.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use trunkline_core::{TrunklineError, TrunklineResult};

use crate::{Delivery, Queue};

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    receipt: Uuid,
    delivery_count: u32,
    item: T,
}

pub struct RedisQueue<T> {
    client: redis::Client,
    name: String,
    visibility_timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn queue_err(e: redis::RedisError) -> TrunklineError {
    TrunklineError::Queue(e.to_string())
}

impl<T> RedisQueue<T> {
    pub fn new(url: &str, name: &str, visibility_timeout: Duration) -> TrunklineResult<Self> {
        let client = redis::Client::open(url).map_err(queue_err)?;
        info!(queue = name, "Redis queue opened");
        Ok(Self {
            client,
            name: name.to_string(),
            visibility_timeout,
            _marker: PhantomData,
        })
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.name)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.name)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.name)
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> RedisQueue<T> {
    async fn conn(&self) -> TrunklineResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(queue_err)
    }

    /// Move due members of a ZSET back onto the ready list.
    async fn promote(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        zset: &str,
    ) -> TrunklineResult<()> {
        let due: Vec<String> = conn
            .zrangebyscore_limit(zset, 0, now_ms() as isize, 0, 64)
            .await
            .map_err(queue_err)?;
        for member in due {
            // ZREM-gated so only one consumer re-queues each member.
            let removed: i64 = conn.zrem(zset, &member).await.map_err(queue_err)?;
            if removed > 0 {
                let _: () = conn
                    .lpush(self.ready_key(), &member)
                    .await
                    .map_err(queue_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T> Queue<T> for RedisQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn enqueue(&self, item: T) -> TrunklineResult<()> {
        let envelope = Envelope {
            receipt: Uuid::new_v4(),
            delivery_count: 0,
            item,
        };
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.conn().await?;
        let _: () = conn
            .lpush(self.ready_key(), payload)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn enqueue_delayed(&self, item: T, delay: Duration) -> TrunklineResult<()> {
        let envelope = Envelope {
            receipt: Uuid::new_v4(),
            delivery_count: 0,
            item,
        };
        let payload = serde_json::to_string(&envelope)?;
        let due = now_ms() + delay.as_millis() as u64;
        let mut conn = self.conn().await?;
        let _: () = conn
            .zadd(self.delayed_key(), payload, due)
            .await
            .map_err(queue_err)?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> TrunklineResult<Option<Delivery<T>>> {
        let give_up = std::time::Instant::now() + wait;
        let mut conn = self.conn().await?;

        loop {
            self.promote(&mut conn, &self.delayed_key()).await?;
            self.promote(&mut conn, &self.inflight_key()).await?;

            let popped: Option<String> = conn.rpop(self.ready_key(), None).await.map_err(queue_err)?;
            if let Some(payload) = popped {
                let mut envelope: Envelope<T> = serde_json::from_str(&payload)?;
                envelope.delivery_count += 1;
                envelope.receipt = Uuid::new_v4();
                let reserialized = serde_json::to_string(&envelope)?;
                let deadline = now_ms() + self.visibility_timeout.as_millis() as u64;
                let _: () = conn
                    .zadd(self.inflight_key(), &reserialized, deadline)
                    .await
                    .map_err(queue_err)?;
                return Ok(Some(Delivery {
                    receipt: envelope.receipt,
                    delivery_count: envelope.delivery_count,
                    item: envelope.item,
                }));
            }

            if std::time::Instant::now() >= give_up {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery<T>) -> TrunklineResult<()> {
        let mut conn = self.conn().await?;
        self.remove_inflight(&mut conn, delivery.receipt).await
    }

    async fn nack(&self, delivery: &Delivery<T>, delay: Duration) -> TrunklineResult<()> {
        let mut conn = self.conn().await?;
        if let Some(payload) = self.take_inflight(&mut conn, delivery.receipt).await? {
            let due = now_ms() + delay.as_millis() as u64;
            let _: () = conn
                .zadd(self.delayed_key(), payload, due)
                .await
                .map_err(queue_err)?;
        }
        Ok(())
    }

    async fn depth(&self) -> TrunklineResult<usize> {
        let mut conn = self.conn().await?;
        let ready: usize = conn.llen(self.ready_key()).await.map_err(queue_err)?;
        let delayed: usize = conn.zcard(self.delayed_key()).await.map_err(queue_err)?;
        Ok(ready + delayed)
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> RedisQueue<T> {
    async fn find_inflight(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        receipt: Uuid,
    ) -> TrunklineResult<Option<String>> {
        // Receipts are embedded in the envelope, so scan the in-flight set.
        // The set is bounded by worker count x visibility window.
        let members: Vec<String> = conn
            .zrange(self.inflight_key(), 0, -1)
            .await
            .map_err(queue_err)?;
        let needle = format!("\"receipt\":\"{receipt}\"");
        Ok(members.into_iter().find(|m| m.contains(&needle)))
    }

    async fn remove_inflight(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        receipt: Uuid,
    ) -> TrunklineResult<()> {
        if let Some(member) = self.find_inflight(conn, receipt).await? {
            let _: i64 = conn
                .zrem(self.inflight_key(), member)
                .await
                .map_err(queue_err)?;
        }
        Ok(())
    }

    async fn take_inflight(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        receipt: Uuid,
    ) -> TrunklineResult<Option<String>> {
        if let Some(member) = self.find_inflight(conn, receipt).await? {
            let removed: i64 = conn
                .zrem(self.inflight_key(), &member)
                .await
                .map_err(queue_err)?;
            if removed > 0 {
                return Ok(Some(member));
            }
        }
        Ok(None)
    }
}
