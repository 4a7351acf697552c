//! Upstream WhatsApp Cloud API client.
//!
//! Sends rendered request bodies and classifies every response into a
//! tagged [`Outcome`] the dispatcher can act on without inspecting HTTP
//! details. The classification table is exhaustive: anything the server
//! or the network can do maps to exactly one variant.

mod client;
mod mock;
mod outcome;

pub use client::{CloudApiClient, PhoneNumberInfo};
pub use mock::{RecordedCall, ScriptedUpstream};
pub use outcome::{Outcome, PermanentKind};

use async_trait::async_trait;
use serde_json::Value;
use trunkline_core::TrunklineResult;
use uuid::Uuid;

/// Seam between the dispatcher and the wire. Transport failures are folded
/// into `Outcome::Transient`; the `Err` side is reserved for programmer
/// error (malformed base URL and the like).
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn send(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: Uuid,
        access_token: &str,
    ) -> TrunklineResult<Outcome>;
}
