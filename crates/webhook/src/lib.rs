//! Webhook ingestion: signed intake endpoint, event demultiplexing, and the
//! asynchronous handlers that fold upstream receipts back into message and
//! campaign state.
//!
//! The synchronous path does only bounded work before the 200: body read,
//! HMAC verify, JSON parse, dedupe insert, queue push. Everything touching
//! the row store happens on the typed queues behind it.

mod handlers;
mod intake;
mod parser;
mod signature;

pub use handlers::{InboundHandler, QualityHandler, StatusHandler, TemplateHandler, TemplateState};
pub use intake::{webhook_router, IngestState};
pub use parser::extract_events;
pub use signature::{sign, verify_challenge, verify_signature};

use std::sync::Arc;
use std::time::Duration;

use trunkline_core::types::WebhookEvent;
use trunkline_queue::{MemoryQueue, Queue};

/// The four typed internal queues the intake fans out to.
#[derive(Clone)]
pub struct WebhookQueues {
    pub statuses: Arc<dyn Queue<WebhookEvent>>,
    pub inbound: Arc<dyn Queue<WebhookEvent>>,
    pub templates: Arc<dyn Queue<WebhookEvent>>,
    pub quality: Arc<dyn Queue<WebhookEvent>>,
}

impl WebhookQueues {
    /// In-process queues for single-node deployments and tests.
    pub fn in_memory(visibility_timeout: Duration) -> Self {
        Self {
            statuses: Arc::new(MemoryQueue::new(visibility_timeout)),
            inbound: Arc::new(MemoryQueue::new(visibility_timeout)),
            templates: Arc::new(MemoryQueue::new(visibility_timeout)),
            quality: Arc::new(MemoryQueue::new(visibility_timeout)),
        }
    }
}
