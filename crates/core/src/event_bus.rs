//! Delivery-event bus — trait for emitting message lifecycle events.
//!
//! The dispatcher emits `Sent`/`Failed` on terminal hand-off, the webhook
//! status handler emits `Delivered`/`Read`/`Failed` receipts. The campaign
//! counter reducer consumes the same stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTransition {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// One message lifecycle transition, as observed by a core component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub message_id: Uuid,
    pub workspace_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub transition: DeliveryTransition,
    pub at: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn new(
        message_id: Uuid,
        workspace_id: Uuid,
        campaign_id: Option<Uuid>,
        transition: DeliveryTransition,
    ) -> Self {
        Self {
            message_id,
            workspace_id,
            campaign_id,
            transition,
            at: Utc::now(),
        }
    }
}

/// Trait for consuming delivery events. Implementations fold events into
/// campaign counters, forward them to analytics, or capture them in tests.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DeliveryEvent);
}

/// No-op sink for components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: DeliveryEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DeliveryEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DeliveryEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_transition(&self, transition: DeliveryTransition) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.transition == transition)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DeliveryEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// A sink that fans one event out to several downstream sinks.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanOutSink {
    fn emit(&self, event: DeliveryEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Convenience: create a no-op event sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let ws = Uuid::new_v4();
        sink.emit(DeliveryEvent::new(
            Uuid::new_v4(),
            ws,
            None,
            DeliveryTransition::Sent,
        ));
        sink.emit(DeliveryEvent::new(
            Uuid::new_v4(),
            ws,
            Some(Uuid::new_v4()),
            DeliveryTransition::Delivered,
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_transition(DeliveryTransition::Sent), 1);
        assert_eq!(sink.count_transition(DeliveryTransition::Delivered), 1);
    }

    #[test]
    fn test_fan_out_sink() {
        let a = capture_sink();
        let b = capture_sink();
        let fan = FanOutSink::new(vec![a.clone(), b.clone()]);

        fan.emit(DeliveryEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            DeliveryTransition::Failed,
        ));

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }
}
