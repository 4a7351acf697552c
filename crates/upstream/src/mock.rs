//! Scripted upstream double for dispatcher and campaign tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use trunkline_core::TrunklineResult;

use crate::{Outcome, UpstreamApi};

/// A recorded upstream call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub path: String,
    pub body: Value,
    pub idempotency_key: Uuid,
}

/// Returns a programmed sequence of outcomes and records every call.
/// When the script runs dry, every further call is `Accepted` with a
/// generated id.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<Vec<Outcome>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes are served in push order.
    pub fn push(&self, outcome: Outcome) {
        self.script.lock().expect("script mutex poisoned").push(outcome);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls mutex poisoned").len()
    }

    /// Number of calls that were answered with `Accepted`.
    pub fn accepted_count(&self) -> usize {
        // Calls beyond the script length are auto-accepted, so count both.
        let calls = self.call_count();
        let script = self.script.lock().expect("script mutex poisoned");
        let scripted_accepts = script
            .iter()
            .take(calls)
            .filter(|o| o.is_accepted())
            .count();
        scripted_accepts + calls.saturating_sub(script.len())
    }
}

#[async_trait]
impl UpstreamApi for ScriptedUpstream {
    async fn send(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: Uuid,
        _access_token: &str,
    ) -> TrunklineResult<Outcome> {
        let index = {
            let mut calls = self.calls.lock().expect("calls mutex poisoned");
            calls.push(RecordedCall {
                path: path.to_string(),
                body: body.clone(),
                idempotency_key,
            });
            calls.len() - 1
        };

        let script = self.script.lock().expect("script mutex poisoned");
        Ok(script.get(index).cloned().unwrap_or(Outcome::Accepted {
            upstream_message_id: format!("wamid.AUTO{index}"),
        }))
    }
}
