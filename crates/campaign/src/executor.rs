//! Drives a campaign through its send lifecycle in bounded batches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use trunkline_core::command::{CommandKind, OutboundCommand};
use trunkline_core::event_bus::EventSink;
use trunkline_core::types::{Campaign, CampaignStatus, Message, MessageKind};
use trunkline_core::{TrunklineError, TrunklineResult};
use trunkline_dispatcher::enqueue_command;
use trunkline_queue::Queue;
use trunkline_store::{CampaignStore, ContactStore, MessageStore, PhoneNumberStore};

use crate::state_machine::CampaignStateMachine;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub batch_size: usize,
    pub batch_poll: Duration,
    pub batch_deadline: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &trunkline_core::AppConfig) -> Self {
        Self {
            batch_size: config.campaign.batch_size,
            batch_poll: Duration::from_millis(config.campaign.batch_poll_ms),
            batch_deadline: Duration::from_secs(config.campaign.batch_deadline_secs),
        }
    }
}

/// Expands a campaign into outbound commands, one batch at a time. Memory
/// stays bounded by the batch size, and pause/cancel take effect within
/// one batch because the executor re-reads campaign status between them.
#[derive(Clone)]
pub struct CampaignExecutor {
    pub campaigns: Arc<dyn CampaignStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub phones: Arc<dyn PhoneNumberStore>,
    pub messages: Arc<dyn MessageStore>,
    pub queue: Arc<dyn Queue<OutboundCommand>>,
    pub events: Arc<dyn EventSink>,
    pub settings: ExecutorSettings,
    pub state_machine: CampaignStateMachine,
    /// Campaigns with a drive loop running in this process. A second
    /// concurrent drive would double-materialize a batch.
    pub driving: Arc<DashMap<Uuid, ()>>,
}

impl CampaignExecutor {
    async fn transition(
        &self,
        id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    ) -> TrunklineResult<bool> {
        self.state_machine.check(from, to)?;
        self.campaigns.cas_status(id, from, to).await
    }

    /// Draft -> Scheduled.
    pub async fn start(&self, id: Uuid) -> TrunklineResult<()> {
        if !self
            .transition(id, CampaignStatus::Draft, CampaignStatus::Scheduled)
            .await?
        {
            return Err(TrunklineError::Campaign(format!(
                "campaign {id} is not a draft"
            )));
        }
        info!(campaign_id = %id, "Campaign scheduled");
        Ok(())
    }

    /// Scheduled -> Sending. The caller spawns `drive` after this.
    pub async fn trigger(&self, id: Uuid) -> TrunklineResult<()> {
        if !self
            .transition(id, CampaignStatus::Scheduled, CampaignStatus::Sending)
            .await?
        {
            return Err(TrunklineError::Campaign(format!(
                "campaign {id} is not scheduled"
            )));
        }
        info!(campaign_id = %id, "Campaign triggered");
        Ok(())
    }

    /// Sending -> Paused. In-flight commands complete normally; their
    /// receipts still accrue to the counters.
    pub async fn pause(&self, id: Uuid) -> TrunklineResult<()> {
        if !self
            .transition(id, CampaignStatus::Sending, CampaignStatus::Paused)
            .await?
        {
            return Err(TrunklineError::Campaign(format!(
                "campaign {id} is not sending"
            )));
        }
        info!(campaign_id = %id, "Campaign paused");
        metrics::counter!("campaign.paused").increment(1);
        Ok(())
    }

    /// Paused -> Sending. The caller spawns `drive` again.
    pub async fn resume(&self, id: Uuid) -> TrunklineResult<()> {
        if !self
            .transition(id, CampaignStatus::Paused, CampaignStatus::Sending)
            .await?
        {
            return Err(TrunklineError::Campaign(format!(
                "campaign {id} is not paused"
            )));
        }
        info!(campaign_id = %id, "Campaign resumed");
        Ok(())
    }

    /// Cancel from Scheduled, Sending or Paused. Sets the tombstone the
    /// dispatcher checks before any upstream call.
    pub async fn cancel(&self, id: Uuid) -> TrunklineResult<()> {
        for from in [
            CampaignStatus::Sending,
            CampaignStatus::Paused,
            CampaignStatus::Scheduled,
        ] {
            if self.campaigns.cas_status(id, from, CampaignStatus::Cancelled).await? {
                info!(campaign_id = %id, "Campaign cancelled");
                metrics::counter!("campaign.cancelled").increment(1);
                return Ok(());
            }
        }
        Err(TrunklineError::Campaign(format!(
            "campaign {id} cannot be cancelled from its current state"
        )))
    }

    /// The batch loop. Expects the campaign to be in `Sending`; returns
    /// when it completes, pauses, is cancelled, or fails.
    pub async fn drive(self, id: Uuid) {
        if self.driving.insert(id, ()).is_some() {
            warn!(campaign_id = %id, "Campaign is already being driven, skipping");
            return;
        }
        if let Err(e) = self.drive_inner(id).await {
            warn!(campaign_id = %id, error = %e, "Campaign execution failed");
            let _ = self
                .campaigns
                .cas_status(id, CampaignStatus::Sending, CampaignStatus::Failed)
                .await;
        }
        self.driving.remove(&id);
    }

    async fn drive_inner(&self, id: Uuid) -> TrunklineResult<()> {
        let campaign = self
            .campaigns
            .get(id)
            .await?
            .ok_or_else(|| TrunklineError::Campaign(format!("campaign {id} not found")))?;

        let phone = self
            .phones
            .get_by_upstream(campaign.workspace_id, &campaign.phone_number_id)
            .await?
            .ok_or_else(|| {
                TrunklineError::Campaign(format!(
                    "campaign {id} has no usable phone number {}",
                    campaign.phone_number_id
                ))
            })?;

        // Stable order: materialization position survives pause/resume
        // because the cursor is the number of messages already created.
        let mut contact_ids = campaign.contact_ids.clone();
        contact_ids.sort();

        loop {
            // Re-read between batches: pause and cancel land here.
            let current = self
                .campaigns
                .get(id)
                .await?
                .ok_or_else(|| TrunklineError::Campaign(format!("campaign {id} vanished")))?;
            if current.status != CampaignStatus::Sending {
                info!(campaign_id = %id, status = ?current.status, "Campaign stopped mid-run");
                return Ok(());
            }

            let cursor = current.counters.total as usize;
            if cursor >= contact_ids.len() {
                break;
            }
            let batch: Vec<Uuid> = contact_ids
                .iter()
                .skip(cursor)
                .take(self.settings.batch_size)
                .copied()
                .collect();

            let batch_ids = self.materialize(&current, &phone.access_token, &batch).await?;
            self.await_batch(id, &batch_ids).await?;
        }

        self.finish(id).await
    }

    /// Create message rows and commands for one batch of contacts.
    async fn materialize(
        &self,
        campaign: &Campaign,
        access_token: &str,
        contact_ids: &[Uuid],
    ) -> TrunklineResult<Vec<Uuid>> {
        let contacts = self.contacts.get_many(contact_ids).await?;
        // The cursor is the total counter, so every contact in the slice
        // counts; ones that no longer resolve are folded in as failures.
        self.campaigns
            .add_total(campaign.id, contact_ids.len() as u64)
            .await?;
        let missing = contact_ids.len() - contacts.len();
        if missing > 0 {
            warn!(
                campaign_id = %campaign.id,
                missing,
                "Contacts missing from store, counted as failed"
            );
            for _ in 0..missing {
                self.campaigns
                    .apply_counter(
                        campaign.id,
                        trunkline_core::event_bus::DeliveryTransition::Failed,
                    )
                    .await?;
            }
        }

        let mut message_ids = Vec::with_capacity(contacts.len());
        for contact in contacts {
            let cmd = OutboundCommand {
                message_id: Uuid::new_v4(),
                workspace_id: campaign.workspace_id,
                phone_number_id: campaign.phone_number_id.clone(),
                access_token: access_token.to_string(),
                to: contact.wa_id.clone(),
                reply_to: None,
                campaign_id: Some(campaign.id),
                payload: CommandKind::Template {
                    name: campaign.template_name.clone(),
                    language_code: campaign.template_language.clone(),
                    components: Vec::new(),
                },
            };
            let row = Message::outbound(
                campaign.workspace_id,
                campaign.phone_number_id.clone(),
                MessageKind::Template,
                contact.wa_id.clone(),
                serde_json::json!({
                    "template": campaign.template_name,
                    "language": campaign.template_language,
                }),
                Some(campaign.id),
            );
            let message_id = enqueue_command(
                self.messages.as_ref(),
                self.queue.as_ref(),
                self.events.as_ref(),
                row,
                cmd,
            )
            .await?;
            message_ids.push(message_id);
        }

        metrics::counter!("campaign.commands_enqueued").increment(message_ids.len() as u64);
        Ok(message_ids)
    }

    /// Block until every message in the batch is past the dispatcher
    /// (Sent or Failed), the campaign leaves `Sending`, or the deadline
    /// expires. Bounds memory and gives back-pressure to the executor.
    async fn await_batch(&self, campaign_id: Uuid, message_ids: &[Uuid]) -> TrunklineResult<()> {
        let deadline = Instant::now() + self.settings.batch_deadline;
        let mut pending: Vec<Uuid> = message_ids.to_vec();

        while !pending.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    campaign_id = %campaign_id,
                    remaining = pending.len(),
                    "Batch deadline expired, moving on"
                );
                return Ok(());
            }

            // Cancel empties the queue-side work; stop waiting early.
            if self.campaigns.is_cancelled(campaign_id).await? {
                return Ok(());
            }

            let mut still_pending = Vec::with_capacity(pending.len());
            for message_id in pending {
                let done = self
                    .messages
                    .get(message_id)
                    .await?
                    .map(|m| m.status.is_dispatch_terminal())
                    .unwrap_or(true);
                if !done {
                    still_pending.push(message_id);
                }
            }
            pending = still_pending;

            if !pending.is_empty() {
                tokio::time::sleep(self.settings.batch_poll).await;
            }
        }
        Ok(())
    }

    /// All contacts materialized: wait for the counters to converge, then
    /// complete. On completion `sent + failed == total`.
    async fn finish(&self, id: Uuid) -> TrunklineResult<()> {
        let deadline = Instant::now() + self.settings.batch_deadline;
        loop {
            let campaign = self
                .campaigns
                .get(id)
                .await?
                .ok_or_else(|| TrunklineError::Campaign(format!("campaign {id} vanished")))?;
            if campaign.status != CampaignStatus::Sending {
                return Ok(());
            }
            let c = campaign.counters;
            if c.sent + c.failed >= c.total || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.settings.batch_poll).await;
        }

        if self
            .transition(id, CampaignStatus::Sending, CampaignStatus::Completed)
            .await?
        {
            info!(campaign_id = %id, "Campaign completed");
            metrics::counter!("campaign.completed").increment(1);
        }
        Ok(())
    }
}
