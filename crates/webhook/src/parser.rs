//! Extracts typed events from the upstream webhook envelope.
//!
//! The envelope is `{"entry":[{"changes":[{"value":{...}}]}]}`; a single
//! `value` can carry several statuses and messages. Each extracted event
//! gets a stable id for the dedupe set — derived from upstream ids where
//! possible, otherwise a content hash.

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use trunkline_core::types::{WebhookEvent, WebhookEventKind};

/// Fields inside a `value` that map to a typed queue.
const STATUS_FIELD: &str = "statuses";
const MESSAGES_FIELD: &str = "messages";
const TEMPLATE_FIELD: &str = "message_template_status_update";
const QUALITY_FIELD: &str = "phone_number_quality_update";

fn content_hash(fragment: &Value) -> String {
    let serialized = fragment.to_string();
    let digest = Sha256::digest(serialized.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

fn make_event(
    workspace_id: Uuid,
    kind: WebhookEventKind,
    event_id: Option<String>,
    payload: Value,
) -> WebhookEvent {
    let event_id = event_id.unwrap_or_else(|| content_hash(&payload));
    WebhookEvent {
        event_id,
        workspace_id,
        kind,
        payload,
        received_at: Utc::now(),
    }
}

/// Walk the envelope and produce one event per status, message, template
/// update, and quality update. Unknown value fields are counted and
/// skipped; adding a kind means adding a queue.
pub fn extract_events(workspace_id: Uuid, body: &Value) -> Vec<WebhookEvent> {
    let mut events = Vec::new();

    let Some(entries) = body["entry"].as_array() else {
        return events;
    };

    for entry in entries {
        let Some(changes) = entry["changes"].as_array() else {
            continue;
        };
        for change in changes {
            let value = &change["value"];
            if !value.is_object() {
                continue;
            }
            let metadata = value["metadata"].clone();

            if let Some(statuses) = value[STATUS_FIELD].as_array() {
                for status in statuses {
                    let id = match (status["id"].as_str(), status["status"].as_str()) {
                        (Some(wamid), Some(name)) => Some(format!("{wamid}:{name}")),
                        _ => None,
                    };
                    events.push(make_event(
                        workspace_id,
                        WebhookEventKind::Status,
                        id,
                        json!({ "status": status, "metadata": metadata }),
                    ));
                }
            }

            if let Some(messages) = value[MESSAGES_FIELD].as_array() {
                let contacts = value["contacts"].clone();
                for message in messages {
                    let id = message["id"].as_str().map(str::to_string);
                    events.push(make_event(
                        workspace_id,
                        WebhookEventKind::InboundMessage,
                        id,
                        json!({
                            "message": message,
                            "contacts": contacts,
                            "metadata": metadata,
                        }),
                    ));
                }
            }

            if value.get(TEMPLATE_FIELD).is_some() {
                let update = &value[TEMPLATE_FIELD];
                let id = match (
                    update["message_template_id"].as_i64(),
                    update["event"].as_str(),
                ) {
                    (Some(template_id), Some(event)) => Some(format!("{template_id}:{event}")),
                    _ => None,
                };
                events.push(make_event(
                    workspace_id,
                    WebhookEventKind::TemplateUpdate,
                    id,
                    update.clone(),
                ));
            }

            if value.get(QUALITY_FIELD).is_some() {
                events.push(make_event(
                    workspace_id,
                    WebhookEventKind::PhoneNumberUpdate,
                    None,
                    json!({
                        "update": value[QUALITY_FIELD],
                        "metadata": metadata,
                    }),
                ));
            }

            let known = [STATUS_FIELD, MESSAGES_FIELD, TEMPLATE_FIELD, QUALITY_FIELD];
            if let Some(object) = value.as_object() {
                for key in object.keys() {
                    if !known.contains(&key.as_str())
                        && !["metadata", "contacts", "messaging_product"].contains(&key.as_str())
                    {
                        debug!(field = %key, "Unknown webhook value field, skipping");
                        metrics::counter!("webhook.unknown_events").increment(1);
                    }
                }
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(value: Value) -> Value {
        json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "9000001",
                "changes": [{ "field": "messages", "value": value }],
            }],
        })
    }

    #[test]
    fn test_status_events_get_compound_ids() {
        let body = envelope(json!({
            "messaging_product": "whatsapp",
            "metadata": { "phone_number_id": "104" },
            "statuses": [
                { "id": "wamid.A", "status": "delivered", "timestamp": "1700000000" },
                { "id": "wamid.A", "status": "read", "timestamp": "1700000100" },
            ],
        }));

        let events = extract_events(Uuid::new_v4(), &body);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, WebhookEventKind::Status);
        assert_eq!(events[0].event_id, "wamid.A:delivered");
        assert_eq!(events[1].event_id, "wamid.A:read");
        assert_eq!(events[0].payload["metadata"]["phone_number_id"], "104");
    }

    #[test]
    fn test_inbound_message_event() {
        let body = envelope(json!({
            "metadata": { "phone_number_id": "104", "display_phone_number": "15550001111" },
            "contacts": [{ "wa_id": "15551234567", "profile": { "name": "Ada" } }],
            "messages": [{
                "id": "wamid.IN1",
                "from": "15551234567",
                "timestamp": "1700000000",
                "type": "text",
                "text": { "body": "hello" },
            }],
        }));

        let events = extract_events(Uuid::new_v4(), &body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, WebhookEventKind::InboundMessage);
        assert_eq!(events[0].event_id, "wamid.IN1");
        assert_eq!(events[0].payload["message"]["text"]["body"], "hello");
        assert_eq!(events[0].payload["contacts"][0]["profile"]["name"], "Ada");
    }

    #[test]
    fn test_template_and_quality_events() {
        let body = envelope(json!({
            "message_template_status_update": {
                "message_template_id": 777,
                "message_template_name": "promo",
                "event": "APPROVED",
            },
        }));
        let events = extract_events(Uuid::new_v4(), &body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, WebhookEventKind::TemplateUpdate);
        assert_eq!(events[0].event_id, "777:APPROVED");

        let body = envelope(json!({
            "metadata": { "phone_number_id": "104" },
            "phone_number_quality_update": {
                "display_phone_number": "15550001111",
                "current_limit": "TIER_10K",
                "event": "DOWNGRADE",
            },
        }));
        let events = extract_events(Uuid::new_v4(), &body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, WebhookEventKind::PhoneNumberUpdate);
        assert!(events[0].event_id.starts_with("sha256:"));
    }

    #[test]
    fn test_id_less_status_gets_content_hash() {
        let body = envelope(json!({
            "statuses": [{ "status": "delivered" }],
        }));
        let events = extract_events(Uuid::new_v4(), &body);
        assert_eq!(events.len(), 1);
        assert!(events[0].event_id.starts_with("sha256:"));

        // Same content, same hash: replays dedupe even without ids.
        let again = extract_events(events[0].workspace_id, &body);
        assert_eq!(again[0].event_id, events[0].event_id);
    }

    #[test]
    fn test_malformed_envelope_yields_nothing() {
        assert!(extract_events(Uuid::new_v4(), &json!({})).is_empty());
        assert!(extract_events(Uuid::new_v4(), &json!({"entry": "nope"})).is_empty());
        assert!(extract_events(Uuid::new_v4(), &json!({"entry": [{"changes": [{}]}]})).is_empty());
    }
}
