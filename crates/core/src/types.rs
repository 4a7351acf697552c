use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SendError;

/// Lifecycle status of a message. Transitions are forward-only by `rank`;
/// `Failed` is reachable from any state and terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position in the forward order. `Failed` ranks above everything so a
    /// failure receipt always wins the CAS.
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Queued => 1,
            MessageStatus::Sending => 2,
            MessageStatus::Sent => 3,
            MessageStatus::Delivered => 4,
            MessageStatus::Read => 5,
            MessageStatus::Failed => u8::MAX,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Read)
    }

    /// Terminal from the dispatcher's point of view: the upstream hand-off
    /// is decided and the command must not be retried.
    pub fn is_dispatch_terminal(&self) -> bool {
        self.rank() >= MessageStatus::Sent.rank()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Template,
    Media,
    Interactive,
    Location,
    Reaction,
}

/// A single outbound or inbound message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// Upstream phone-number id the message was sent from / received on.
    pub phone_number_id: String,
    pub direction: MessageDirection,
    pub kind: MessageKind,
    /// Recipient (outbound) or sender (inbound) in wa_id form.
    pub peer: String,
    /// Rendered upstream payload (outbound) or raw event payload (inbound).
    pub payload: serde_json::Value,
    pub upstream_message_id: Option<String>,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub last_error: Option<SendError>,
    /// Worker currently holding the message in `Sending`.
    pub worker_id: Option<String>,
    /// When the current `Sending` claim expires and may be reaped.
    pub claim_deadline: Option<DateTime<Utc>>,
    pub campaign_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    /// New outbound message in `Pending`, ready to be enqueued.
    pub fn outbound(
        workspace_id: Uuid,
        phone_number_id: String,
        kind: MessageKind,
        peer: String,
        payload: serde_json::Value,
        campaign_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            phone_number_id,
            direction: MessageDirection::Outbound,
            kind,
            peer,
            payload,
            upstream_message_id: None,
            status: MessageStatus::Pending,
            attempt_count: 0,
            last_error: None,
            worker_id: None,
            claim_deadline: None,
            campaign_id,
            created_at: Utc::now(),
            queued_at: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            deleted_at: None,
        }
    }

    /// Stamp the timestamp column that corresponds to `status`.
    pub fn stamp(&mut self, status: MessageStatus, at: DateTime<Utc>) {
        match status {
            MessageStatus::Queued => self.queued_at = Some(at),
            MessageStatus::Sent => self.sent_at = Some(at),
            MessageStatus::Delivered => self.delivered_at = Some(at),
            MessageStatus::Read => self.read_at = Some(at),
            MessageStatus::Failed => self.failed_at = Some(at),
            _ => {}
        }
    }
}

/// Upstream-assigned reputation for a business phone number.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityRating {
    Green,
    Yellow,
    Red,
    Unknown,
}

impl QualityRating {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "GREEN" => QualityRating::Green,
            "YELLOW" => QualityRating::Yellow,
            "RED" => QualityRating::Red,
            _ => QualityRating::Unknown,
        }
    }
}

/// Convert an upstream messaging-limit tier string into a daily cap.
pub fn parse_messaging_tier(tier: Option<&str>) -> u64 {
    match tier {
        Some("TIER_50") => 50,
        Some("TIER_250") => 250,
        Some("TIER_1K") => 1_000,
        Some("TIER_10K") => 10_000,
        Some("TIER_100K") => 100_000,
        Some("TIER_UNLIMITED") => 999_999_999,
        _ => 1_000,
    }
}

/// A registered WhatsApp Business number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// Upstream phone-number id (opaque string).
    pub phone_number_id: String,
    pub display_number: String,
    /// Handle to the encrypted upstream access token.
    pub access_token: String,
    pub quality_rating: QualityRating,
    pub messaging_limit_tier: Option<String>,
    pub daily_cap: u64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Tenant boundary. Owns phone numbers, contacts, messages and campaigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    /// Secret for webhook HMAC verification.
    pub webhook_secret: String,
    /// Token echoed during the webhook subscribe handshake.
    pub verify_token: String,
    /// Per-workspace limiter rate override (messages/second).
    pub rate_limit: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// A known WhatsApp user the workspace has exchanged messages with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub workspace_id: Uuid,
    /// WhatsApp id, E.164 without the leading plus.
    pub wa_id: String,
    pub profile_name: Option<String>,
    pub opted_in: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

/// Aggregate delivery counters for a campaign. Eventually consistent with
/// message statuses; folded by the counter reducer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total: u64,
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
}

/// A bulk send: one template fanned out over a contact set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    /// Upstream phone-number id the campaign sends from.
    pub phone_number_id: String,
    pub template_name: String,
    pub template_language: String,
    pub contact_ids: Vec<Uuid>,
    pub status: CampaignStatus,
    pub counters: CampaignCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Kind tag for the typed internal webhook queues.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    Status,
    InboundMessage,
    TemplateUpdate,
    PhoneNumberUpdate,
}

/// A webhook event as extracted by the intake pipeline and carried on the
/// internal queues. The `event_id` is unique per workspace and backs the
/// dedupe set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub workspace_id: Uuid,
    pub kind: WebhookEventKind,
    /// The `value`-level payload fragment this event was extracted from.
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_rank_order() {
        assert!(MessageStatus::Pending.rank() < MessageStatus::Queued.rank());
        assert!(MessageStatus::Queued.rank() < MessageStatus::Sending.rank());
        assert!(MessageStatus::Sending.rank() < MessageStatus::Sent.rank());
        assert!(MessageStatus::Sent.rank() < MessageStatus::Delivered.rank());
        assert!(MessageStatus::Delivered.rank() < MessageStatus::Read.rank());
        // Failed outranks everything.
        assert!(MessageStatus::Failed.rank() > MessageStatus::Read.rank());
    }

    #[test]
    fn test_messaging_tier_mapping() {
        assert_eq!(parse_messaging_tier(Some("TIER_1K")), 1_000);
        assert_eq!(parse_messaging_tier(Some("TIER_100K")), 100_000);
        assert_eq!(parse_messaging_tier(Some("TIER_BOGUS")), 1_000);
        assert_eq!(parse_messaging_tier(None), 1_000);
    }

    #[test]
    fn test_stamp_sets_matching_column() {
        let mut msg = Message::outbound(
            Uuid::new_v4(),
            "123".into(),
            MessageKind::Text,
            "15551234567".into(),
            serde_json::json!({}),
            None,
        );
        let now = Utc::now();
        msg.stamp(MessageStatus::Sent, now);
        assert_eq!(msg.sent_at, Some(now));
        assert!(msg.delivered_at.is_none());
    }
}
