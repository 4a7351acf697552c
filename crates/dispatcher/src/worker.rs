//! One dispatcher worker: dequeue, claim, limit, render, send, apply the
//! classified outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use trunkline_core::command::OutboundCommand;
use trunkline_core::error::{SendError, SendErrorKind};
use trunkline_core::event_bus::{DeliveryEvent, DeliveryTransition, EventSink};
use trunkline_core::types::MessageStatus;
use trunkline_core::TrunklineResult;
use trunkline_limiter::{Decision, RateLimiter};
use trunkline_queue::{Delivery, Queue};
use trunkline_store::{CampaignStore, CasResult, ClaimResult, MessageStore, StatusUpdate};
use trunkline_upstream::{Outcome, PermanentKind, UpstreamApi};

use crate::{backoff::compute_backoff, DispatcherSettings};

/// Shared handles a worker needs. Cheap to clone; everything is an Arc.
#[derive(Clone)]
pub struct DispatcherContext {
    pub queue: Arc<dyn Queue<OutboundCommand>>,
    pub messages: Arc<dyn MessageStore>,
    pub campaigns: Arc<dyn CampaignStore>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<dyn UpstreamApi>,
    pub events: Arc<dyn EventSink>,
    pub settings: DispatcherSettings,
}

pub struct Worker {
    id: String,
    ctx: DispatcherContext,
}

/// What the loop should do with the queue delivery after processing.
enum Disposition {
    Ack,
    Nack(Duration),
}

impl Worker {
    pub fn new(id: impl Into<String>, ctx: DispatcherContext) -> Self {
        Self { id: id.into(), ctx }
    }

    /// Run until the shutdown signal flips. One command in memory at a time.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Dispatcher worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let dequeued = tokio::select! {
                result = self.ctx.queue.dequeue(self.ctx.settings.dequeue_wait) => result,
                _ = shutdown.changed() => continue,
            };

            let delivery = match dequeued {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match self.process(&delivery).await {
                Ok(Disposition::Ack) => {
                    if let Err(e) = self.ctx.queue.ack(&delivery).await {
                        error!(worker_id = %self.id, error = %e, "Ack failed");
                    }
                }
                Ok(Disposition::Nack(delay)) => {
                    if let Err(e) = self.ctx.queue.nack(&delivery, delay).await {
                        error!(worker_id = %self.id, error = %e, "Nack failed");
                    }
                }
                Err(e) => {
                    // Store/queue infrastructure error: leave the delivery to
                    // expire and redeliver; the claim CAS keeps this safe.
                    error!(
                        worker_id = %self.id,
                        message_id = %delivery.item.message_id,
                        error = %e,
                        "Command processing hit an infrastructure error"
                    );
                    metrics::counter!("dispatcher.process_errors").increment(1);
                }
            }
        }
        info!(worker_id = %self.id, "Dispatcher worker stopped");
    }

    async fn process(&self, delivery: &Delivery<OutboundCommand>) -> TrunklineResult<Disposition> {
        let cmd = &delivery.item;
        let started = Instant::now();

        // Cancelled campaign: fail the message before any upstream work.
        if let Some(campaign_id) = cmd.campaign_id {
            if self.ctx.campaigns.is_cancelled(campaign_id).await? {
                return self.drop_cancelled(cmd).await;
            }
        }

        // Claim the row: Queued -> Sending, or reap an expired claim left
        // by a crashed worker. Losing the claim means another worker holds
        // it or the send is already decided; this delivery is done.
        let deadline = chrono::Utc::now()
            + chrono::Duration::from_std(self.ctx.settings.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let claim = self
            .ctx
            .messages
            .claim(cmd.message_id, &self.id, deadline)
            .await?;

        match claim {
            ClaimResult::Claimed => {}
            ClaimResult::InFlight => {
                debug!(message_id = %cmd.message_id, "Another worker holds a live claim");
                metrics::counter!("dispatcher.duplicates_dropped").increment(1);
                return Ok(Disposition::Ack);
            }
            ClaimResult::AlreadyDone { status } => {
                debug!(
                    message_id = %cmd.message_id,
                    status = ?status,
                    "Dropping duplicate delivery"
                );
                metrics::counter!("dispatcher.duplicates_dropped").increment(1);
                return Ok(Disposition::Ack);
            }
            ClaimResult::Missing => {
                warn!(message_id = %cmd.message_id, "Command without a message row");
                return Ok(Disposition::Ack);
            }
        }

        // Rate limiting: phone number, workspace, global. Wait in place for
        // short hints; release the claim when the wait would outlive our
        // visibility window.
        let claim_deadline = started + self.ctx.settings.visibility_timeout;
        loop {
            match self
                .ctx
                .limiter
                .acquire(&cmd.phone_number_id, cmd.workspace_id)
                .await
            {
                Decision::Granted => break,
                Decision::Wait(hint) => {
                    let now = Instant::now();
                    // Half the window is the most we will sit on a claim.
                    let budget = claim_deadline
                        .saturating_duration_since(now)
                        .checked_div(2)
                        .unwrap_or(Duration::ZERO);
                    if hint > budget {
                        metrics::counter!("dispatcher.limiter_released").increment(1);
                        return self.release_claim(cmd, hint).await;
                    }
                    tokio::time::sleep(hint).await;
                }
            }
        }

        // Render. A rejection is a permanent, caller-caused failure.
        let rendered = match trunkline_renderer::render(cmd) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(message_id = %cmd.message_id, error = %e, "Command failed validation");
                metrics::counter!("dispatcher.render_rejections").increment(1);
                return self
                    .fail(
                        cmd,
                        SendError::new(SendErrorKind::InvalidCommand, None, e.to_string()),
                    )
                    .await;
            }
        };

        // Send, message id as the idempotency key.
        let outcome = self
            .ctx
            .upstream
            .send(
                &rendered.path,
                &rendered.body,
                cmd.message_id,
                &cmd.access_token,
            )
            .await?;

        let disposition = self.apply_outcome(cmd, delivery, outcome).await?;
        metrics::histogram!("dispatcher.command_seconds").record(started.elapsed().as_secs_f64());
        Ok(disposition)
    }

    async fn apply_outcome(
        &self,
        cmd: &OutboundCommand,
        delivery: &Delivery<OutboundCommand>,
        outcome: Outcome,
    ) -> TrunklineResult<Disposition> {
        match outcome {
            Outcome::Accepted {
                upstream_message_id,
            } => {
                let result = self
                    .ctx
                    .messages
                    .cas_status(
                        cmd.message_id,
                        MessageStatus::Sending,
                        MessageStatus::Sent,
                        StatusUpdate {
                            upstream_message_id: Some(upstream_message_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                if !matches!(result, CasResult::Swapped) {
                    // A webhook receipt can only land after the upstream id
                    // is stored, so this is unexpected; log and move on.
                    warn!(
                        message_id = %cmd.message_id,
                        result = ?result,
                        "Accepted send lost the Sent CAS"
                    );
                }
                info!(
                    message_id = %cmd.message_id,
                    upstream_message_id = %upstream_message_id,
                    attempt = delivery.delivery_count,
                    "Message handed off to upstream"
                );
                metrics::counter!("dispatcher.sent").increment(1);
                self.emit(cmd, DeliveryTransition::Sent);
                Ok(Disposition::Ack)
            }

            Outcome::Permanent { code, reason, kind } => {
                let error_kind = match kind {
                    PermanentKind::Auth => {
                        // Token refresh is handled out-of-band; flag it.
                        warn!(
                            phone_number_id = %cmd.phone_number_id,
                            workspace_id = %cmd.workspace_id,
                            "Upstream rejected credentials, signalling token refresh"
                        );
                        metrics::counter!("dispatcher.token_refresh_signals").increment(1);
                        SendErrorKind::AuthExpired
                    }
                    _ => SendErrorKind::PermanentUpstream,
                };
                metrics::counter!("dispatcher.permanent_failures").increment(1);
                self.fail(cmd, SendError::new(error_kind, Some(code), reason))
                    .await
            }

            Outcome::Transient {
                retry_after,
                reason,
            } => {
                let attempts = self
                    .ctx
                    .messages
                    .get(cmd.message_id)
                    .await?
                    .map(|m| m.attempt_count)
                    .unwrap_or(u32::MAX);

                if attempts >= self.ctx.settings.max_attempts {
                    metrics::counter!("dispatcher.retries_exhausted").increment(1);
                    return self
                        .fail(
                            cmd,
                            SendError::new(
                                SendErrorKind::TransientUpstream,
                                None,
                                format!("retries exhausted: {reason}"),
                            ),
                        )
                        .await;
                }

                let delay =
                    retry_after.unwrap_or_else(|| compute_backoff(&self.ctx.settings, attempts));
                debug!(
                    message_id = %cmd.message_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Transient upstream failure, retrying"
                );
                metrics::counter!("dispatcher.retries").increment(1);
                self.requeue(cmd, delay, None).await
            }

            Outcome::RateLimited { retry_after } => {
                let delay =
                    retry_after.unwrap_or_else(|| compute_backoff(&self.ctx.settings, 1));
                self.ctx.limiter.penalize(&cmd.phone_number_id, delay);
                metrics::counter!("dispatcher.upstream_rate_limited").increment(1);
                // The attempt was spent on a 429, not a real try; restore it.
                self.requeue(cmd, delay, Some(true)).await
            }
        }
    }

    /// CAS Sending -> Queued and schedule redelivery.
    async fn requeue(
        &self,
        cmd: &OutboundCommand,
        delay: Duration,
        restore_attempt: Option<bool>,
    ) -> TrunklineResult<Disposition> {
        let result = self
            .ctx
            .messages
            .cas_status(
                cmd.message_id,
                MessageStatus::Sending,
                MessageStatus::Queued,
                StatusUpdate {
                    decrement_attempts: restore_attempt.unwrap_or(false),
                    ..Default::default()
                },
            )
            .await?;
        if !matches!(result, CasResult::Swapped) {
            warn!(message_id = %cmd.message_id, result = ?result, "Requeue lost the CAS");
            return Ok(Disposition::Ack);
        }
        Ok(Disposition::Nack(delay))
    }

    /// Release a claim taken at step 2 when the limiter wait is too long:
    /// the attempt is un-counted and the command redelivered at the hint.
    async fn release_claim(
        &self,
        cmd: &OutboundCommand,
        hint: Duration,
    ) -> TrunklineResult<Disposition> {
        let result = self
            .ctx
            .messages
            .cas_status(
                cmd.message_id,
                MessageStatus::Sending,
                MessageStatus::Queued,
                StatusUpdate {
                    decrement_attempts: true,
                    ..Default::default()
                },
            )
            .await?;
        if !matches!(result, CasResult::Swapped) {
            warn!(message_id = %cmd.message_id, result = ?result, "Release lost the CAS");
            return Ok(Disposition::Ack);
        }
        debug!(
            message_id = %cmd.message_id,
            wait_ms = hint.as_millis() as u64,
            "Released claim for rate-limiter wait"
        );
        Ok(Disposition::Nack(hint))
    }

    /// Terminal failure: CAS Sending -> Failed and emit the event.
    async fn fail(&self, cmd: &OutboundCommand, error: SendError) -> TrunklineResult<Disposition> {
        let result = self
            .ctx
            .messages
            .cas_status(
                cmd.message_id,
                MessageStatus::Sending,
                MessageStatus::Failed,
                StatusUpdate {
                    error: Some(error),
                    ..Default::default()
                },
            )
            .await?;
        if !matches!(result, CasResult::Swapped) {
            warn!(message_id = %cmd.message_id, result = ?result, "Fail transition lost the CAS");
            return Ok(Disposition::Ack);
        }
        metrics::counter!("dispatcher.failed").increment(1);
        self.emit(cmd, DeliveryTransition::Failed);
        Ok(Disposition::Ack)
    }

    /// Cancelled-campaign drop: the row may still be `Queued` (we never
    /// claimed it) so fail from there.
    async fn drop_cancelled(&self, cmd: &OutboundCommand) -> TrunklineResult<Disposition> {
        let result = self
            .ctx
            .messages
            .cas_status(
                cmd.message_id,
                MessageStatus::Queued,
                MessageStatus::Failed,
                StatusUpdate {
                    error: Some(SendError::cancelled()),
                    ..Default::default()
                },
            )
            .await?;
        if matches!(result, CasResult::Swapped) {
            metrics::counter!("dispatcher.cancelled_dropped").increment(1);
            self.emit(cmd, DeliveryTransition::Failed);
        }
        Ok(Disposition::Ack)
    }

    fn emit(&self, cmd: &OutboundCommand, transition: DeliveryTransition) {
        self.ctx.events.emit(DeliveryEvent::new(
            cmd.message_id,
            cmd.workspace_id,
            cmd.campaign_id,
            transition,
        ));
    }
}

/// Enqueue helper used by the API layer and the campaign executor: insert
/// the row as `Pending`, flip it to `Queued`, then push the command.
pub async fn enqueue_command(
    messages: &dyn MessageStore,
    queue: &dyn Queue<OutboundCommand>,
    events: &dyn EventSink,
    mut message: trunkline_core::types::Message,
    cmd: OutboundCommand,
) -> TrunklineResult<Uuid> {
    let message_id = cmd.message_id;
    message.id = message_id;
    messages.insert(message).await?;
    let result = messages
        .cas_status(
            message_id,
            MessageStatus::Pending,
            MessageStatus::Queued,
            StatusUpdate::default(),
        )
        .await?;
    if !matches!(result, CasResult::Swapped) {
        return Err(trunkline_core::TrunklineError::Store(format!(
            "message {message_id} already queued"
        )));
    }
    events.emit(DeliveryEvent::new(
        message_id,
        cmd.workspace_id,
        cmd.campaign_id,
        DeliveryTransition::Queued,
    ));
    queue.enqueue(cmd).await?;
    Ok(message_id)
}
