//! Campaign counter reducer.
//!
//! Consumes the same delivery-event stream the dispatcher and webhook
//! status handler produce and folds it into campaign counters. Emission is
//! non-blocking: events go through a channel to a background fold task, so
//! the reducer can sit on the synchronous `EventSink` seam.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use trunkline_core::event_bus::{DeliveryEvent, EventSink};
use trunkline_store::CampaignStore;

pub struct CounterReducer {
    sender: mpsc::Sender<DeliveryEvent>,
}

impl CounterReducer {
    /// Create the reducer and spawn its background fold task.
    pub fn spawn(campaigns: Arc<dyn CampaignStore>) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::channel::<DeliveryEvent>(16_384);

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let Some(campaign_id) = event.campaign_id else {
                    continue;
                };
                if let Err(e) = campaigns.apply_counter(campaign_id, event.transition).await {
                    warn!(
                        campaign_id = %campaign_id,
                        error = %e,
                        "Counter fold failed"
                    );
                }
            }
            info!("Counter reducer drained");
        });

        Arc::new(Self { sender })
    }
}

impl EventSink for CounterReducer {
    fn emit(&self, event: DeliveryEvent) {
        if event.campaign_id.is_none() {
            return;
        }
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!("campaign.counter_events_dropped").increment(1);
            warn!("Campaign counter event dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use trunkline_core::event_bus::DeliveryTransition;
    use trunkline_core::types::{Campaign, CampaignStatus};
    use trunkline_store::MemoryCampaignStore;
    use uuid::Uuid;

    fn campaign() -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "re-engage".into(),
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
        }
    }

    #[tokio::test]
    async fn test_reducer_folds_transitions() {
        let campaigns = Arc::new(MemoryCampaignStore::new());
        let c = campaign();
        let id = c.id;
        let ws = c.workspace_id;
        campaigns.insert(c).await.unwrap();

        let reducer = CounterReducer::spawn(campaigns.clone());
        for transition in [
            DeliveryTransition::Sent,
            DeliveryTransition::Delivered,
            DeliveryTransition::Read,
            DeliveryTransition::Failed,
        ] {
            reducer.emit(DeliveryEvent::new(Uuid::new_v4(), ws, Some(id), transition));
        }
        // No campaign id: ignored.
        reducer.emit(DeliveryEvent::new(
            Uuid::new_v4(),
            ws,
            None,
            DeliveryTransition::Sent,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let row = campaigns.get(id).await.unwrap().unwrap();
        assert_eq!(row.counters.sent, 1);
        assert_eq!(row.counters.delivered, 1);
        assert_eq!(row.counters.read, 1);
        assert_eq!(row.counters.failed, 1);
    }
}
