//! Work queues with at-least-once delivery and visibility timeouts.
//!
//! A dequeued item stays invisible until it is acked, nacked, or its
//! visibility deadline passes; then it is redelivered. Consumers must
//! tolerate duplicates — in Trunkline the dispatcher's status CAS makes
//! reprocessing a no-op.

mod memory;
mod redis_queue;

pub use memory::MemoryQueue;
pub use redis_queue::RedisQueue;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use trunkline_core::TrunklineResult;

/// One delivery of a queued item. The receipt identifies this delivery for
/// ack/nack; redeliveries of the same item carry fresh receipts.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub receipt: Uuid,
    pub item: T,
    /// How many times this item has been delivered, this one included.
    pub delivery_count: u32,
}

#[async_trait]
pub trait Queue<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Make the item available immediately.
    async fn enqueue(&self, item: T) -> TrunklineResult<()>;

    /// Make the item available after `delay`.
    async fn enqueue_delayed(&self, item: T, delay: Duration) -> TrunklineResult<()>;

    /// Take one item, blocking up to `wait` for availability. The item
    /// becomes invisible for the queue's visibility timeout.
    async fn dequeue(&self, wait: Duration) -> TrunklineResult<Option<Delivery<T>>>;

    /// Permanently remove a delivered item.
    async fn ack(&self, delivery: &Delivery<T>) -> TrunklineResult<()>;

    /// Return a delivered item to the queue, redeliverable after `delay`.
    async fn nack(&self, delivery: &Delivery<T>, delay: Duration) -> TrunklineResult<()>;

    /// Items currently visible or delayed (not in-flight). For tests and
    /// back-pressure checks, not a consistency primitive.
    async fn depth(&self) -> TrunklineResult<usize>;
}
