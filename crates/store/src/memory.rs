//! DashMap-backed store implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use trunkline_core::error::SendError;
use trunkline_core::event_bus::DeliveryTransition;
use trunkline_core::types::{
    Campaign, CampaignStatus, Contact, Message, MessageStatus, PhoneNumber, QualityRating,
    Workspace,
};
use trunkline_core::{TrunklineError, TrunklineResult};

use crate::{
    AdvanceResult, CampaignStore, CasResult, ClaimResult, ContactStore, MessageStore,
    PhoneNumberStore, StatusUpdate, WorkspaceStore,
};

/// In-memory message rows with an upstream-id secondary index.
#[derive(Default)]
pub struct MemoryMessageStore {
    rows: DashMap<Uuid, Message>,
    by_upstream: DashMap<String, Uuid>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn apply_update(message: &mut Message, update: StatusUpdate) {
    if let Some(upstream_id) = update.upstream_message_id {
        message.upstream_message_id = Some(upstream_id);
    }
    if let Some(worker_id) = update.worker_id {
        message.worker_id = Some(worker_id);
    }
    if let Some(error) = update.error {
        message.last_error = Some(error);
    }
    if update.increment_attempts {
        message.attempt_count += 1;
    }
    if update.decrement_attempts {
        message.attempt_count = message.attempt_count.saturating_sub(1);
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, message: Message) -> TrunklineResult<()> {
        if let Some(upstream_id) = &message.upstream_message_id {
            self.by_upstream.insert(upstream_id.clone(), message.id);
        }
        self.rows.insert(message.id, message);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Message>> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn find_by_upstream_id(&self, upstream_id: &str) -> TrunklineResult<Option<Message>> {
        let Some(id) = self.by_upstream.get(upstream_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        deadline: DateTime<Utc>,
    ) -> TrunklineResult<ClaimResult> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(ClaimResult::Missing);
        };
        let claimable = match row.status {
            MessageStatus::Queued => true,
            // A dead worker's claim is reaped once its deadline passes.
            MessageStatus::Sending => match row.claim_deadline {
                Some(claim_deadline) => claim_deadline <= Utc::now(),
                None => true,
            },
            _ => false,
        };
        if !claimable {
            if row.status == MessageStatus::Sending {
                return Ok(ClaimResult::InFlight);
            }
            return Ok(ClaimResult::AlreadyDone { status: row.status });
        }

        row.status = MessageStatus::Sending;
        row.worker_id = Some(worker_id.to_string());
        row.claim_deadline = Some(deadline);
        row.attempt_count += 1;
        Ok(ClaimResult::Claimed)
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected: MessageStatus,
        next: MessageStatus,
        update: StatusUpdate,
    ) -> TrunklineResult<CasResult> {
        // The entry lock makes check-then-set atomic per row.
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(CasResult::Missing);
        };
        if row.status != expected {
            return Ok(CasResult::Conflict { actual: row.status });
        }

        row.status = next;
        let now = Utc::now();
        row.stamp(next, now);
        if next != MessageStatus::Sending {
            row.claim_deadline = None;
        }
        let had_upstream = update.upstream_message_id.clone();
        apply_update(&mut row, update);
        drop(row);

        if let Some(upstream_id) = had_upstream {
            self.by_upstream.insert(upstream_id, id);
        }
        Ok(CasResult::Swapped)
    }

    async fn advance_delivery(
        &self,
        upstream_id: &str,
        target: MessageStatus,
        at: DateTime<Utc>,
        error: Option<SendError>,
    ) -> TrunklineResult<AdvanceResult> {
        let Some(id) = self.by_upstream.get(upstream_id).map(|r| *r) else {
            return Ok(AdvanceResult::NotFound);
        };
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Ok(AdvanceResult::NotFound);
        };

        let current = row.status;
        if target != MessageStatus::Failed && target.rank() <= current.rank() {
            return Ok(AdvanceResult::Stale { current });
        }
        if current == MessageStatus::Failed {
            return Ok(AdvanceResult::Stale { current });
        }

        row.status = target;
        row.stamp(target, at);
        // A read receipt implies delivery even if that receipt never came.
        if target == MessageStatus::Read && row.delivered_at.is_none() {
            row.delivered_at = Some(at);
        }
        if let Some(error) = error {
            row.last_error = Some(error);
        }
        Ok(AdvanceResult::Advanced { from: current })
    }
}

/// In-memory campaigns with atomic counter folds.
#[derive(Default)]
pub struct MemoryCampaignStore {
    rows: DashMap<Uuid, Campaign>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn insert(&self, campaign: Campaign) -> TrunklineResult<()> {
        self.rows.insert(campaign.id, campaign);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Campaign>> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn cas_status(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        next: CampaignStatus,
    ) -> TrunklineResult<bool> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Err(TrunklineError::Store(format!("campaign {id} not found")));
        };
        if row.status != expected {
            return Ok(false);
        }
        row.status = next;
        let now = Utc::now();
        match next {
            CampaignStatus::Sending if row.started_at.is_none() => row.started_at = Some(now),
            CampaignStatus::Paused => row.paused_at = Some(now),
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed => {
                row.completed_at = Some(now)
            }
            _ => {}
        }
        Ok(true)
    }

    async fn is_cancelled(&self, id: Uuid) -> TrunklineResult<bool> {
        Ok(self
            .rows
            .get(&id)
            .map(|r| r.status == CampaignStatus::Cancelled)
            .unwrap_or(false))
    }

    async fn add_total(&self, id: Uuid, total: u64) -> TrunklineResult<()> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            return Err(TrunklineError::Store(format!("campaign {id} not found")));
        };
        row.counters.total += total;
        Ok(())
    }

    async fn apply_counter(&self, id: Uuid, transition: DeliveryTransition) -> TrunklineResult<()> {
        let Some(mut row) = self.rows.get_mut(&id) else {
            // Counter events may outlive a deleted campaign; drop them.
            return Ok(());
        };
        match transition {
            DeliveryTransition::Queued => {}
            DeliveryTransition::Sent => row.counters.sent += 1,
            DeliveryTransition::Delivered => row.counters.delivered += 1,
            DeliveryTransition::Read => row.counters.read += 1,
            DeliveryTransition::Failed => row.counters.failed += 1,
        }
        Ok(())
    }
}

/// In-memory contacts with a (workspace, wa_id) uniqueness index.
#[derive(Default)]
pub struct MemoryContactStore {
    rows: DashMap<Uuid, Contact>,
    by_wa_id: DashMap<(Uuid, String), Uuid>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn resolve_or_create(
        &self,
        workspace_id: Uuid,
        wa_id: &str,
        profile_name: Option<String>,
    ) -> TrunklineResult<Contact> {
        let key = (workspace_id, wa_id.to_string());
        if let Some(id) = self.by_wa_id.get(&key).map(|r| *r) {
            if let Some(mut row) = self.rows.get_mut(&id) {
                if profile_name.is_some() && row.profile_name.is_none() {
                    row.profile_name = profile_name;
                }
                return Ok(row.clone());
            }
        }

        let contact = Contact {
            id: Uuid::new_v4(),
            workspace_id,
            wa_id: wa_id.to_string(),
            profile_name,
            opted_in: false,
            created_at: Utc::now(),
        };
        self.by_wa_id.insert(key, contact.id);
        self.rows.insert(contact.id, contact.clone());
        Ok(contact)
    }

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Contact>> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn get_many(&self, ids: &[Uuid]) -> TrunklineResult<Vec<Contact>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.rows.get(id).map(|r| r.clone()))
            .collect())
    }
}

/// In-memory phone numbers with an upstream-id index.
#[derive(Default)]
pub struct MemoryPhoneNumberStore {
    rows: DashMap<Uuid, PhoneNumber>,
    by_upstream: DashMap<String, Uuid>,
}

impl MemoryPhoneNumberStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PhoneNumberStore for MemoryPhoneNumberStore {
    async fn upsert(&self, number: PhoneNumber) -> TrunklineResult<()> {
        self.by_upstream
            .insert(number.phone_number_id.clone(), number.id);
        self.rows.insert(number.id, number);
        Ok(())
    }

    async fn get_by_upstream(
        &self,
        workspace_id: Uuid,
        phone_number_id: &str,
    ) -> TrunklineResult<Option<PhoneNumber>> {
        Ok(self
            .find_by_upstream(phone_number_id)
            .await?
            .filter(|n| n.workspace_id == workspace_id && n.deleted_at.is_none()))
    }

    async fn find_by_upstream(
        &self,
        phone_number_id: &str,
    ) -> TrunklineResult<Option<PhoneNumber>> {
        let Some(id) = self.by_upstream.get(phone_number_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }

    async fn update_quality(
        &self,
        phone_number_id: &str,
        rating: QualityRating,
        tier: Option<String>,
    ) -> TrunklineResult<()> {
        let Some(id) = self.by_upstream.get(phone_number_id).map(|r| *r) else {
            return Err(TrunklineError::Store(format!(
                "phone number {phone_number_id} not found"
            )));
        };
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.quality_rating = rating;
            if tier.is_some() {
                row.daily_cap = trunkline_core::types::parse_messaging_tier(tier.as_deref());
                row.messaging_limit_tier = tier;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWorkspaceStore {
    rows: DashMap<Uuid, Workspace>,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn insert(&self, workspace: Workspace) -> TrunklineResult<()> {
        self.rows.insert(workspace.id, workspace);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Workspace>> {
        Ok(self.rows.get(&id).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trunkline_core::error::{SendError, SendErrorKind};
    use trunkline_core::types::MessageKind;

    fn message() -> Message {
        Message::outbound(
            Uuid::new_v4(),
            "104".into(),
            MessageKind::Text,
            "15551234567".into(),
            serde_json::json!({}),
            None,
        )
    }

    #[tokio::test]
    async fn test_cas_status_happy_path_and_conflict() {
        let store = MemoryMessageStore::new();
        let msg = message();
        let id = msg.id;
        store.insert(msg).await.unwrap();

        let result = store
            .cas_status(
                id,
                MessageStatus::Pending,
                MessageStatus::Queued,
                StatusUpdate::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, CasResult::Swapped);

        // Second CAS from the same expected state loses.
        let result = store
            .cas_status(
                id,
                MessageStatus::Pending,
                MessageStatus::Queued,
                StatusUpdate::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            CasResult::Conflict {
                actual: MessageStatus::Queued
            }
        );
    }

    #[tokio::test]
    async fn test_claim_and_reap() {
        let store = MemoryMessageStore::new();
        let mut msg = message();
        msg.status = MessageStatus::Queued;
        let id = msg.id;
        store.insert(msg).await.unwrap();

        // First worker claims.
        let soon = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(
            store.claim(id, "w0", soon).await.unwrap(),
            ClaimResult::Claimed
        );
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Sending);
        assert_eq!(row.worker_id.as_deref(), Some("w0"));
        assert_eq!(row.attempt_count, 1);

        // A second worker cannot steal a live claim.
        assert_eq!(
            store.claim(id, "w1", soon).await.unwrap(),
            ClaimResult::InFlight
        );

        // Simulate the first worker dying: expire the deadline.
        store
            .rows
            .get_mut(&id)
            .unwrap()
            .claim_deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        assert_eq!(
            store.claim(id, "w1", soon).await.unwrap(),
            ClaimResult::Claimed
        );
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.worker_id.as_deref(), Some("w1"));
        assert_eq!(row.attempt_count, 2);
    }

    #[tokio::test]
    async fn test_claim_respects_terminal_states() {
        let store = MemoryMessageStore::new();
        let mut msg = message();
        msg.status = MessageStatus::Sent;
        let id = msg.id;
        store.insert(msg).await.unwrap();

        let soon = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(
            store.claim(id, "w0", soon).await.unwrap(),
            ClaimResult::AlreadyDone {
                status: MessageStatus::Sent
            }
        );
        assert_eq!(
            store.claim(Uuid::new_v4(), "w0", soon).await.unwrap(),
            ClaimResult::Missing
        );
    }

    #[tokio::test]
    async fn test_cas_indexes_upstream_id() {
        let store = MemoryMessageStore::new();
        let msg = message();
        let id = msg.id;
        store.insert(msg).await.unwrap();

        for (expected, next) in [
            (MessageStatus::Pending, MessageStatus::Queued),
            (MessageStatus::Queued, MessageStatus::Sending),
        ] {
            store
                .cas_status(id, expected, next, StatusUpdate::default())
                .await
                .unwrap();
        }
        store
            .cas_status(
                id,
                MessageStatus::Sending,
                MessageStatus::Sent,
                StatusUpdate {
                    upstream_message_id: Some("wamid.FOO".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let found = store.find_by_upstream_id("wamid.FOO").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.status, MessageStatus::Sent);
        assert!(found.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_advance_delivery_rank_order() {
        let store = MemoryMessageStore::new();
        let mut msg = message();
        msg.status = MessageStatus::Sent;
        msg.upstream_message_id = Some("wamid.BAR".into());
        store.insert(msg).await.unwrap();

        let now = Utc::now();
        // Delivered after Sent: advances.
        assert_eq!(
            store
                .advance_delivery("wamid.BAR", MessageStatus::Delivered, now, None)
                .await
                .unwrap(),
            AdvanceResult::Advanced {
                from: MessageStatus::Sent
            }
        );
        // Replayed Delivered: stale.
        assert_eq!(
            store
                .advance_delivery("wamid.BAR", MessageStatus::Delivered, now, None)
                .await
                .unwrap(),
            AdvanceResult::Stale {
                current: MessageStatus::Delivered
            }
        );
        // Read advances and back-fills nothing (delivered_at already set).
        assert!(matches!(
            store
                .advance_delivery("wamid.BAR", MessageStatus::Read, now, None)
                .await
                .unwrap(),
            AdvanceResult::Advanced { .. }
        ));
        // A failure receipt always wins over a non-failed state.
        let result = store
            .advance_delivery("wamid.BAR", MessageStatus::Failed, now, None)
            .await
            .unwrap();
        assert!(matches!(result, AdvanceResult::Advanced { .. }));
    }

    #[tokio::test]
    async fn test_advance_delivery_failed_is_terminal() {
        let store = MemoryMessageStore::new();
        let mut msg = message();
        msg.status = MessageStatus::Sent;
        msg.upstream_message_id = Some("wamid.DEAD".into());
        store.insert(msg).await.unwrap();

        let now = Utc::now();
        store
            .advance_delivery(
                "wamid.DEAD",
                MessageStatus::Failed,
                now,
                Some(SendError::new(
                    SendErrorKind::PermanentUpstream,
                    Some(131026),
                    "unreachable",
                )),
            )
            .await
            .unwrap();

        // Nothing moves a failed message.
        assert_eq!(
            store
                .advance_delivery("wamid.DEAD", MessageStatus::Delivered, now, None)
                .await
                .unwrap(),
            AdvanceResult::Stale {
                current: MessageStatus::Failed
            }
        );
    }

    #[tokio::test]
    async fn test_read_receipt_backfills_delivered_at() {
        let store = MemoryMessageStore::new();
        let mut msg = message();
        msg.status = MessageStatus::Sent;
        msg.upstream_message_id = Some("wamid.SKIP".into());
        store.insert(msg).await.unwrap();

        // Read arrives without a Delivered receipt.
        store
            .advance_delivery("wamid.SKIP", MessageStatus::Read, Utc::now(), None)
            .await
            .unwrap();
        let row = store.find_by_upstream_id("wamid.SKIP").await.unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Read);
        assert!(row.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_contact_resolution_is_idempotent() {
        let store = MemoryContactStore::new();
        let ws = Uuid::new_v4();

        let first = store
            .resolve_or_create(ws, "15551234567", None)
            .await
            .unwrap();
        let second = store
            .resolve_or_create(ws, "15551234567", Some("Ada".into()))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.profile_name.as_deref(), Some("Ada"));

        // Different workspace, different contact.
        let other = store
            .resolve_or_create(Uuid::new_v4(), "15551234567", None)
            .await
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn test_campaign_counters_and_tombstone() {
        let store = MemoryCampaignStore::new();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "spring".into(),
            phone_number_id: "104".into(),
            template_name: "promo".into(),
            template_language: "en".into(),
            contact_ids: vec![],
            status: CampaignStatus::Sending,
            counters: Default::default(),
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            completed_at: None,
        };
        let id = campaign.id;
        store.insert(campaign).await.unwrap();

        store.add_total(id, 3).await.unwrap();
        store.apply_counter(id, DeliveryTransition::Sent).await.unwrap();
        store.apply_counter(id, DeliveryTransition::Failed).await.unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.counters.total, 3);
        assert_eq!(row.counters.sent, 1);
        assert_eq!(row.counters.failed, 1);
        assert!(row.counters.sent + row.counters.failed <= row.counters.total);

        assert!(!store.is_cancelled(id).await.unwrap());
        assert!(store
            .cas_status(id, CampaignStatus::Sending, CampaignStatus::Cancelled)
            .await
            .unwrap());
        assert!(store.is_cancelled(id).await.unwrap());
    }
}
