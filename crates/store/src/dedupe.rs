//! Webhook-event dedupe sets.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use trunkline_core::{TrunklineError, TrunklineResult};

use crate::DedupeStore;

/// In-memory dedupe set with lazy TTL pruning.
#[derive(Default)]
pub struct MemoryDedupe {
    seen: DashMap<(Uuid, String), Instant>,
}

impl MemoryDedupe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[async_trait]
impl DedupeStore for MemoryDedupe {
    async fn insert_if_absent(
        &self,
        workspace_id: Uuid,
        event_id: &str,
        ttl: Duration,
    ) -> TrunklineResult<bool> {
        let now = Instant::now();
        // Lazy prune: drop a few expired entries per call so the map stays
        // bounded without a background task.
        self.seen.retain(|_, expires_at| *expires_at > now);

        let key = (workspace_id, event_id.to_string());
        match self.seen.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now + ttl);
                Ok(true)
            }
        }
    }
}

/// Redis dedupe set using SET NX EX, one key per (workspace, event id).
pub struct RedisDedupe {
    client: redis::Client,
}

impl RedisDedupe {
    pub fn new(url: &str) -> TrunklineResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| TrunklineError::Store(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DedupeStore for RedisDedupe {
    async fn insert_if_absent(
        &self,
        workspace_id: Uuid,
        event_id: &str,
        ttl: Duration,
    ) -> TrunklineResult<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TrunklineError::Store(e.to_string()))?;
        let key = format!("dedupe:{workspace_id}:{event_id}");
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| TrunklineError::Store(e.to_string()))?;
        Ok(set.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_insert_wins_replay_loses() {
        let dedupe = MemoryDedupe::new();
        let ws = Uuid::new_v4();

        assert!(dedupe
            .insert_if_absent(ws, "evt-001", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!dedupe
            .insert_if_absent(ws, "evt-001", Duration::from_secs(60))
            .await
            .unwrap());

        // Same id in another workspace is a distinct event.
        assert!(dedupe
            .insert_if_absent(Uuid::new_v4(), "evt-001", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_reinserted() {
        let dedupe = MemoryDedupe::new();
        let ws = Uuid::new_v4();

        assert!(dedupe
            .insert_if_absent(ws, "evt-002", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dedupe
            .insert_if_absent(ws, "evt-002", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
