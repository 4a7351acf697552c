//! Asynchronous consumers of the typed webhook queues.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use trunkline_core::error::{SendError, SendErrorKind};
use trunkline_core::event_bus::{DeliveryEvent, DeliveryTransition, EventSink};
use trunkline_core::types::{
    parse_messaging_tier, Message, MessageDirection, MessageKind, MessageStatus, QualityRating,
    WebhookEvent,
};
use trunkline_core::TrunklineResult;
use trunkline_limiter::RateLimiter;
use trunkline_queue::{Delivery, Queue};
use trunkline_store::{AdvanceResult, ContactStore, MessageStore, PhoneNumberStore};

/// Unix-seconds string to timestamp, falling back to now.
fn parse_timestamp(raw: &Value) -> DateTime<Utc> {
    raw.as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| raw.as_i64())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

async fn consume<F, Fut>(
    name: &'static str,
    queue: Arc<dyn Queue<WebhookEvent>>,
    mut shutdown: watch::Receiver<bool>,
    retry_delay: Duration,
    mut handle: F,
) where
    F: FnMut(Delivery<WebhookEvent>) -> Fut,
    Fut: std::future::Future<Output = TrunklineResult<Disposition>>,
{
    info!(handler = name, "Webhook handler started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let dequeued = tokio::select! {
            result = queue.dequeue(Duration::from_secs(5)) => result,
            _ = shutdown.changed() => continue,
        };
        let delivery = match dequeued {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                warn!(handler = name, error = %e, "Dequeue failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        match handle(delivery.clone()).await {
            Ok(Disposition::Done) => {
                let _ = queue.ack(&delivery).await;
            }
            Ok(Disposition::RetryAfter(delay)) => {
                let _ = queue.nack(&delivery, delay).await;
            }
            Err(e) => {
                warn!(handler = name, error = %e, "Event handling failed, retrying");
                metrics::counter!("webhook.handler_errors", "handler" => name).increment(1);
                let _ = queue.nack(&delivery, retry_delay).await;
            }
        }
    }
    info!(handler = name, "Webhook handler stopped");
}

enum Disposition {
    Done,
    RetryAfter(Duration),
}

// ---------------------------------------------------------------------------
// Status handler
// ---------------------------------------------------------------------------

/// Folds delivery receipts into message rows via the rank-ordered CAS, and
/// forwards the transition to the campaign counter reducer.
pub struct StatusHandler {
    pub messages: Arc<dyn MessageStore>,
    pub events: Arc<dyn EventSink>,
    /// How long to buffer a receipt that arrives before its message row
    /// carries the upstream id.
    pub grace: Duration,
}

impl StatusHandler {
    pub async fn run(self, queue: Arc<dyn Queue<WebhookEvent>>, shutdown: watch::Receiver<bool>) {
        let handler = Arc::new(self);
        consume("status", queue, shutdown, Duration::from_secs(5), move |d| {
            let handler = handler.clone();
            async move { handler.handle(d).await }
        })
        .await;
    }

    async fn handle(&self, delivery: Delivery<WebhookEvent>) -> TrunklineResult<Disposition> {
        let event = &delivery.item;
        let status = &event.payload["status"];
        let Some(wamid) = status["id"].as_str() else {
            warn!(event_id = %event.event_id, "Status event without a message id");
            return Ok(Disposition::Done);
        };
        let Some(status_name) = status["status"].as_str() else {
            warn!(event_id = %event.event_id, "Status event without a status");
            return Ok(Disposition::Done);
        };

        let target = match status_name {
            "sent" => MessageStatus::Sent,
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            "failed" => MessageStatus::Failed,
            other => {
                debug!(status = other, "Ignoring unhandled status kind");
                return Ok(Disposition::Done);
            }
        };

        let at = parse_timestamp(&status["timestamp"]);
        let error = (target == MessageStatus::Failed).then(|| {
            let detail = status["errors"][0]["message"]
                .as_str()
                .or_else(|| status["errors"][0]["title"].as_str())
                .unwrap_or("delivery failed");
            SendError::new(
                SendErrorKind::PermanentUpstream,
                status["errors"][0]["code"].as_i64(),
                detail,
            )
        });

        match self.messages.advance_delivery(wamid, target, at, error).await? {
            AdvanceResult::Advanced { from } => {
                debug!(
                    upstream_message_id = wamid,
                    from = ?from,
                    to = ?target,
                    "Message status advanced"
                );
                metrics::counter!("webhook.status_applied").increment(1);
                if let Some(message) = self.messages.find_by_upstream_id(wamid).await? {
                    let transition = match target {
                        MessageStatus::Delivered => DeliveryTransition::Delivered,
                        MessageStatus::Read => DeliveryTransition::Read,
                        MessageStatus::Failed => DeliveryTransition::Failed,
                        _ => DeliveryTransition::Sent,
                    };
                    self.events.emit(DeliveryEvent {
                        message_id: message.id,
                        workspace_id: message.workspace_id,
                        campaign_id: message.campaign_id,
                        transition,
                        at,
                    });
                }
                Ok(Disposition::Done)
            }
            AdvanceResult::Stale { current } => {
                // Replay or out-of-order receipt that no longer matters.
                debug!(
                    upstream_message_id = wamid,
                    current = ?current,
                    receipt = ?target,
                    "Stale status receipt dropped"
                );
                metrics::counter!("webhook.status_stale").increment(1);
                Ok(Disposition::Done)
            }
            AdvanceResult::NotFound => {
                // The receipt beat the dispatcher's Sent CAS. Buffer one
                // grace period, then give up on correlation.
                if delivery.delivery_count == 1 {
                    debug!(upstream_message_id = wamid, "Early receipt, buffering");
                    metrics::counter!("webhook.status_buffered").increment(1);
                    Ok(Disposition::RetryAfter(self.grace))
                } else {
                    warn!(
                        upstream_message_id = wamid,
                        "Receipt never matched a message, dropping"
                    );
                    metrics::counter!("webhook.status_orphaned").increment(1);
                    Ok(Disposition::Done)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound handler
// ---------------------------------------------------------------------------

/// Persists user-initiated messages: resolves the contact, stores a new
/// inbound row with media kept as opaque upstream references.
pub struct InboundHandler {
    pub messages: Arc<dyn MessageStore>,
    pub contacts: Arc<dyn ContactStore>,
}

impl InboundHandler {
    pub async fn run(self, queue: Arc<dyn Queue<WebhookEvent>>, shutdown: watch::Receiver<bool>) {
        let handler = Arc::new(self);
        consume("inbound", queue, shutdown, Duration::from_secs(5), move |d| {
            let handler = handler.clone();
            async move { handler.handle(d).await }
        })
        .await;
    }

    fn infer_kind(message_type: &str) -> MessageKind {
        match message_type {
            "text" | "button" => MessageKind::Text,
            "image" | "video" | "audio" | "document" | "sticker" => MessageKind::Media,
            "interactive" => MessageKind::Interactive,
            "location" => MessageKind::Location,
            "reaction" => MessageKind::Reaction,
            _ => MessageKind::Text,
        }
    }

    async fn handle(&self, delivery: Delivery<WebhookEvent>) -> TrunklineResult<Disposition> {
        let event = &delivery.item;
        let message = &event.payload["message"];
        let Some(wamid) = message["id"].as_str() else {
            warn!(event_id = %event.event_id, "Inbound event without a message id");
            return Ok(Disposition::Done);
        };
        let Some(from) = message["from"].as_str() else {
            warn!(event_id = %event.event_id, "Inbound event without a sender");
            return Ok(Disposition::Done);
        };

        // A redelivered event may already be persisted.
        if self.messages.find_by_upstream_id(wamid).await?.is_some() {
            debug!(upstream_message_id = wamid, "Inbound message already stored");
            return Ok(Disposition::Done);
        }

        let profile_name = event.payload["contacts"][0]["profile"]["name"]
            .as_str()
            .map(str::to_string);
        let contact = self
            .contacts
            .resolve_or_create(event.workspace_id, from, profile_name)
            .await?;

        let message_type = message["type"].as_str().unwrap_or("text");
        let phone_number_id = event.payload["metadata"]["phone_number_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let row = Message {
            id: Uuid::new_v4(),
            workspace_id: event.workspace_id,
            phone_number_id,
            direction: MessageDirection::Inbound,
            kind: Self::infer_kind(message_type),
            peer: contact.wa_id.clone(),
            // The raw fragment keeps media ids as opaque upstream refs to
            // be resolved lazily on download.
            payload: message.clone(),
            upstream_message_id: Some(wamid.to_string()),
            status: MessageStatus::Delivered,
            attempt_count: 0,
            last_error: None,
            worker_id: None,
            claim_deadline: None,
            campaign_id: None,
            created_at: parse_timestamp(&message["timestamp"]),
            queued_at: None,
            sent_at: None,
            delivered_at: Some(parse_timestamp(&message["timestamp"])),
            read_at: None,
            failed_at: None,
            deleted_at: None,
        };
        self.messages.insert(row).await?;

        info!(
            upstream_message_id = wamid,
            contact_id = %contact.id,
            message_type,
            "Inbound message stored"
        );
        metrics::counter!("webhook.inbound_stored").increment(1);
        Ok(Disposition::Done)
    }
}

// ---------------------------------------------------------------------------
// Template handler
// ---------------------------------------------------------------------------

/// Registry of template approval states, folded from TEMPLATE_UPDATES.
#[derive(Default)]
pub struct TemplateState {
    statuses: DashMap<(Uuid, String), String>,
}

impl TemplateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, workspace_id: Uuid, template_name: &str) -> Option<String> {
        self.statuses
            .get(&(workspace_id, template_name.to_string()))
            .map(|s| s.clone())
    }
}

pub struct TemplateHandler {
    pub templates: Arc<TemplateState>,
}

impl TemplateHandler {
    pub async fn run(self, queue: Arc<dyn Queue<WebhookEvent>>, shutdown: watch::Receiver<bool>) {
        let handler = Arc::new(self);
        consume("template", queue, shutdown, Duration::from_secs(5), move |d| {
            let handler = handler.clone();
            async move { handler.handle(d).await }
        })
        .await;
    }

    async fn handle(&self, delivery: Delivery<WebhookEvent>) -> TrunklineResult<Disposition> {
        let event = &delivery.item;
        let name = event.payload["message_template_name"].as_str();
        let status = event.payload["event"].as_str();
        if let (Some(name), Some(status)) = (name, status) {
            info!(template = name, status, "Template status update");
            self.templates
                .statuses
                .insert((event.workspace_id, name.to_string()), status.to_string());
            metrics::counter!("webhook.template_updates").increment(1);
        } else {
            warn!(event_id = %event.event_id, "Template update missing fields");
        }
        Ok(Disposition::Done)
    }
}

// ---------------------------------------------------------------------------
// Quality handler
// ---------------------------------------------------------------------------

/// Applies phone-number quality/tier changes to the store and gates the
/// per-number send rate by the new rating.
pub struct QualityHandler {
    pub phones: Arc<dyn PhoneNumberStore>,
    pub limiter: Arc<RateLimiter>,
    pub base_rate: u64,
}

impl QualityHandler {
    pub async fn run(self, queue: Arc<dyn Queue<WebhookEvent>>, shutdown: watch::Receiver<bool>) {
        let handler = Arc::new(self);
        consume("quality", queue, shutdown, Duration::from_secs(5), move |d| {
            let handler = handler.clone();
            async move { handler.handle(d).await }
        })
        .await;
    }

    /// Send-rate gate by rating: RED quarters, YELLOW halves.
    fn gated_rate(&self, rating: QualityRating) -> u64 {
        match rating {
            QualityRating::Red => (self.base_rate / 4).max(1),
            QualityRating::Yellow => (self.base_rate / 2).max(1),
            QualityRating::Green | QualityRating::Unknown => self.base_rate,
        }
    }

    async fn handle(&self, delivery: Delivery<WebhookEvent>) -> TrunklineResult<Disposition> {
        let event = &delivery.item;
        let update = &event.payload["update"];
        let Some(phone_number_id) = event.payload["metadata"]["phone_number_id"].as_str() else {
            warn!(event_id = %event.event_id, "Quality update without a phone number id");
            return Ok(Disposition::Done);
        };

        let rating = update["event"]
            .as_str()
            .map(|e| match e {
                "UPGRADE" | "ONBOARDING" => QualityRating::Green,
                "DOWNGRADE" => QualityRating::Yellow,
                "FLAGGED" => QualityRating::Red,
                other => QualityRating::parse(other),
            })
            .unwrap_or(QualityRating::Unknown);
        let tier = update["current_limit"].as_str().map(str::to_string);

        if let Err(e) = self
            .phones
            .update_quality(phone_number_id, rating, tier.clone())
            .await
        {
            // A quality event for a number we no longer hold is not worth
            // a retry loop.
            warn!(phone_number_id, error = %e, "Quality update for unknown number");
            return Ok(Disposition::Done);
        }
        self.limiter
            .set_number_rate(phone_number_id, self.gated_rate(rating));

        info!(
            phone_number_id,
            rating = ?rating,
            daily_cap = parse_messaging_tier(tier.as_deref()),
            "Phone number quality updated"
        );
        metrics::counter!("webhook.quality_updates").increment(1);
        Ok(Disposition::Done)
    }
}
