//! In-process queue used for single-node deployments and tests.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use trunkline_core::TrunklineResult;

use crate::{Delivery, Queue};

struct Entry<T> {
    item: T,
    delivery_count: u32,
}

struct InFlight<T> {
    deadline: Instant,
    entry: Entry<T>,
}

struct Inner<T> {
    ready: VecDeque<Entry<T>>,
    // Reverse-ordered by due time so the heap pops the earliest item.
    delayed: BinaryHeap<(Reverse<Instant>, Uuid)>,
    delayed_items: HashMap<Uuid, Entry<T>>,
    in_flight: HashMap<Uuid, InFlight<T>>,
}

/// Bounded-latency in-memory queue with visibility timeouts and delayed
/// redelivery.
pub struct MemoryQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
}

impl<T: Send + 'static> MemoryQueue<T> {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                delayed_items: HashMap::new(),
                in_flight: HashMap::new(),
            }),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    /// Promote due delayed items and reap expired in-flight deliveries.
    fn sweep(inner: &mut Inner<T>) {
        let now = Instant::now();

        while let Some((Reverse(due), id)) = inner.delayed.peek().copied() {
            if due > now {
                break;
            }
            inner.delayed.pop();
            if let Some(entry) = inner.delayed_items.remove(&id) {
                inner.ready.push_back(entry);
            }
        }

        let expired: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(flight) = inner.in_flight.remove(&id) {
                metrics::counter!("queue.visibility_expired").increment(1);
                inner.ready.push_back(flight.entry);
            }
        }
    }

    /// Earliest instant at which a sleeping consumer must wake to promote
    /// a delayed item or reap an expired delivery.
    fn next_due(inner: &Inner<T>) -> Option<Instant> {
        let delayed = inner.delayed.peek().map(|(Reverse(due), _)| *due);
        let in_flight = inner.in_flight.values().map(|f| f.deadline).min();
        match (delayed, in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Queue<T> for MemoryQueue<T> {
    async fn enqueue(&self, item: T) -> TrunklineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ready.push_back(Entry {
            item,
            delivery_count: 0,
        });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn enqueue_delayed(&self, item: T, delay: Duration) -> TrunklineResult<()> {
        let id = Uuid::new_v4();
        let due = Instant::now() + delay;
        let mut inner = self.inner.lock().await;
        inner.delayed.push((Reverse(due), id));
        inner.delayed_items.insert(
            id,
            Entry {
                item,
                delivery_count: 0,
            },
        );
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> TrunklineResult<Option<Delivery<T>>> {
        let give_up = Instant::now() + wait;

        loop {
            {
                let mut inner = self.inner.lock().await;
                Self::sweep(&mut inner);

                if let Some(mut entry) = inner.ready.pop_front() {
                    entry.delivery_count += 1;
                    let receipt = Uuid::new_v4();
                    let delivery = Delivery {
                        receipt,
                        item: entry.item.clone(),
                        delivery_count: entry.delivery_count,
                    };
                    inner.in_flight.insert(
                        receipt,
                        InFlight {
                            deadline: Instant::now() + self.visibility_timeout,
                            entry,
                        },
                    );
                    return Ok(Some(delivery));
                }
            }

            let now = Instant::now();
            if now >= give_up {
                return Ok(None);
            }

            // Sleep until new work arrives, something becomes due, or the
            // caller's wait budget runs out.
            let mut sleep_until = give_up;
            {
                let inner = self.inner.lock().await;
                if let Some(due) = Self::next_due(&inner) {
                    sleep_until = sleep_until.min(due);
                }
            }
            let timeout = sleep_until.saturating_duration_since(now);
            let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery<T>) -> TrunklineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery<T>, delay: Duration) -> TrunklineResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(flight) = inner.in_flight.remove(&delivery.receipt) {
            let id = Uuid::new_v4();
            let due = Instant::now() + delay;
            inner.delayed.push((Reverse(due), id));
            inner.delayed_items.insert(id, flight.entry);
        }
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn depth(&self) -> TrunklineResult<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.ready.len() + inner.delayed_items.len())
    }
}
