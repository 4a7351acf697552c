//! Row-store seams for messages, campaigns, contacts and tenants.
//!
//! The transactional store itself is an external collaborator; these traits
//! capture exactly the operations the core needs — point reads, inserts,
//! and the compare-and-swap status transitions that serialize worker races.
//! The in-memory implementations back single-node deployments and tests.

mod dedupe;
mod memory;

pub use dedupe::{MemoryDedupe, RedisDedupe};
pub use memory::{
    MemoryCampaignStore, MemoryContactStore, MemoryMessageStore, MemoryPhoneNumberStore,
    MemoryWorkspaceStore,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use trunkline_core::error::SendError;
use trunkline_core::types::{
    Campaign, CampaignStatus, Contact, Message, MessageStatus, PhoneNumber, QualityRating,
    Workspace,
};
use trunkline_core::TrunklineResult;

/// Fields a status CAS may set alongside the transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub upstream_message_id: Option<String>,
    pub error: Option<SendError>,
    pub worker_id: Option<String>,
    pub increment_attempts: bool,
    /// Un-count an attempt when a command is released before any send
    /// (rate-limiter wait): the attempt was never spent against upstream.
    pub decrement_attempts: bool,
}

/// Result of a compare-and-swap on a message's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The transition was applied.
    Swapped,
    /// Another writer got there first; `actual` is what we found.
    Conflict { actual: MessageStatus },
    /// No such message.
    Missing,
}

/// Result of a dispatcher claim (step 2 of the worker loop).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// The row is now `Sending`, owned by this worker.
    Claimed,
    /// Another worker holds a live claim; drop the duplicate delivery.
    InFlight,
    /// The message is already past dispatch (or still pending); nothing
    /// left for the dispatcher to do.
    AlreadyDone { status: MessageStatus },
    Missing,
}

/// Result of a rank-ordered forward advance (webhook status path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceResult {
    Advanced { from: MessageStatus },
    /// The row already ranks at or above the target; receipt is stale.
    Stale { current: MessageStatus },
    NotFound,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: Message) -> TrunklineResult<()>;

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Message>>;

    /// Indexed lookup by the upstream message id, set at accept time.
    async fn find_by_upstream_id(&self, upstream_id: &str) -> TrunklineResult<Option<Message>>;

    /// Dispatcher step-2 claim: `Queued -> Sending`, or re-acquire a
    /// `Sending` row whose claim deadline has expired (crashed worker).
    /// Records the worker id, bumps the attempt counter, and sets the new
    /// deadline atomically.
    async fn claim(
        &self,
        id: Uuid,
        worker_id: &str,
        deadline: DateTime<Utc>,
    ) -> TrunklineResult<ClaimResult>;

    /// Atomically transition `expected -> next`, applying `update` and
    /// stamping the matching timestamp column only when the current status
    /// equals `expected`.
    async fn cas_status(
        &self,
        id: Uuid,
        expected: MessageStatus,
        next: MessageStatus,
        update: StatusUpdate,
    ) -> TrunklineResult<CasResult>;

    /// Rank-ordered forward CAS keyed by upstream id: applies the target
    /// status only if it increases the rank (Failed always wins). Stamps
    /// `at` into the matching timestamp column.
    async fn advance_delivery(
        &self,
        upstream_id: &str,
        target: MessageStatus,
        at: DateTime<Utc>,
        error: Option<SendError>,
    ) -> TrunklineResult<AdvanceResult>;
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert(&self, campaign: Campaign) -> TrunklineResult<()>;

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Campaign>>;

    /// Atomically transition the campaign status, stamping the matching
    /// timestamp. Returns false when the current status differs.
    async fn cas_status(
        &self,
        id: Uuid,
        expected: CampaignStatus,
        next: CampaignStatus,
    ) -> TrunklineResult<bool>;

    /// Dispatcher tombstone check: commands of cancelled campaigns are
    /// dropped before any upstream call.
    async fn is_cancelled(&self, id: Uuid) -> TrunklineResult<bool>;

    /// Add `total` to the campaign's expected-message counter.
    async fn add_total(&self, id: Uuid, total: u64) -> TrunklineResult<()>;

    /// Fold one delivery transition into the counters.
    async fn apply_counter(
        &self,
        id: Uuid,
        transition: trunkline_core::event_bus::DeliveryTransition,
    ) -> TrunklineResult<()>;
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn resolve_or_create(
        &self,
        workspace_id: Uuid,
        wa_id: &str,
        profile_name: Option<String>,
    ) -> TrunklineResult<Contact>;

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Contact>>;

    /// Fetch a batch of contacts preserving the requested order. Missing
    /// ids are skipped.
    async fn get_many(&self, ids: &[Uuid]) -> TrunklineResult<Vec<Contact>>;
}

#[async_trait]
pub trait PhoneNumberStore: Send + Sync {
    async fn upsert(&self, number: PhoneNumber) -> TrunklineResult<()>;

    /// Lookup by the upstream phone-number id, scoped to a workspace to
    /// prevent cross-tenant access.
    async fn get_by_upstream(
        &self,
        workspace_id: Uuid,
        phone_number_id: &str,
    ) -> TrunklineResult<Option<PhoneNumber>>;

    /// Lookup across workspaces, for webhook routing where only the
    /// upstream id is known.
    async fn find_by_upstream(&self, phone_number_id: &str)
        -> TrunklineResult<Option<PhoneNumber>>;

    async fn update_quality(
        &self,
        phone_number_id: &str,
        rating: QualityRating,
        tier: Option<String>,
    ) -> TrunklineResult<()>;
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn insert(&self, workspace: Workspace) -> TrunklineResult<()>;

    async fn get(&self, id: Uuid) -> TrunklineResult<Option<Workspace>>;
}

/// Dedupe set for webhook events. Entries expire after the TTL so storage
/// stays bounded by the upstream retry horizon.
#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Returns true when the id was absent and has now been recorded;
    /// false when the event was already seen (replay).
    async fn insert_if_absent(
        &self,
        workspace_id: Uuid,
        event_id: &str,
        ttl: Duration,
    ) -> TrunklineResult<bool>;
}
