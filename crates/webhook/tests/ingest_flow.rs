//! Intake-to-handler flows: signature checks, dedupe, status correlation.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;
use uuid::Uuid;

use trunkline_core::event_bus::{capture_sink, DeliveryTransition};
use trunkline_core::types::{
    Message, MessageDirection, MessageKind, MessageStatus, Workspace,
};
use trunkline_queue::Queue;
use trunkline_store::{
    ContactStore, MemoryContactStore, MemoryDedupe, MemoryMessageStore, MemoryWorkspaceStore,
    MessageStore, WorkspaceStore,
};
use trunkline_webhook::{
    sign, webhook_router, IngestState, InboundHandler, StatusHandler, WebhookQueues,
};

struct Rig {
    router: axum::Router,
    workspace: Workspace,
    queues: WebhookQueues,
    messages: Arc<MemoryMessageStore>,
    contacts: Arc<MemoryContactStore>,
}

async fn rig() -> Rig {
    let workspaces = Arc::new(MemoryWorkspaceStore::new());
    let workspace = Workspace {
        id: Uuid::new_v4(),
        name: "acme".into(),
        webhook_secret: "wh-secret".into(),
        verify_token: "verify-me".into(),
        rate_limit: None,
        created_at: chrono::Utc::now(),
    };
    workspaces.insert(workspace.clone()).await.unwrap();

    let queues = WebhookQueues::in_memory(Duration::from_secs(30));
    let state = IngestState {
        workspaces,
        dedupe: Arc::new(MemoryDedupe::new()),
        queues: queues.clone(),
        max_body_bytes: 1024 * 1024,
        dedupe_ttl: Duration::from_secs(3600),
    };

    Rig {
        router: webhook_router(state),
        workspace,
        queues,
        messages: Arc::new(MemoryMessageStore::new()),
        contacts: Arc::new(MemoryContactStore::new()),
    }
}

fn status_body(wamid: &str, status: &str) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "9000001",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": { "phone_number_id": "104" },
                    "statuses": [{
                        "id": wamid,
                        "status": status,
                        "timestamp": "1700000000",
                        "recipient_id": "15551234567",
                    }],
                },
            }],
        }],
    })
}

async fn post_signed(rig: &Rig, body: &Value, secret: &str) -> StatusCode {
    let raw = serde_json::to_vec(body).unwrap();
    let signature = sign(&raw, secret);
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/webhook/{}", rig.workspace.id))
        .header("content-type", "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(raw))
        .unwrap();
    rig.router
        .clone()
        .oneshot(request)
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_challenge_echo() {
    let rig = rig().await;
    let request = Request::builder()
        .uri(format!(
            "/v1/webhook/{}?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=4242",
            rig.workspace.id
        ))
        .body(Body::empty())
        .unwrap();
    let response = rig.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    assert_eq!(&bytes[..], b"4242");

    // Wrong token: 403.
    let request = Request::builder()
        .uri(format!(
            "/v1/webhook/{}?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=4242",
            rig.workspace.id
        ))
        .body(Body::empty())
        .unwrap();
    let response = rig.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_bad_signature_is_rejected_and_nothing_queued() {
    let rig = rig().await;
    let body = status_body("wamid.X", "delivered");

    let status = post_signed(&rig, &body, "some-other-secret").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(rig.queues.statuses.depth().await.unwrap(), 0);

    // Unsigned request fails too.
    let raw = serde_json::to_vec(&body).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/webhook/{}", rig.workspace.id))
        .body(Body::from(raw))
        .unwrap();
    let response = rig.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_bad_json_is_400() {
    let rig = rig().await;
    let raw = b"{not json".to_vec();
    let signature = sign(&raw, "wh-secret");
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/webhook/{}", rig.workspace.id))
        .header("x-hub-signature-256", signature)
        .body(Body::from(raw))
        .unwrap();
    let response = rig.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let workspaces = Arc::new(MemoryWorkspaceStore::new());
    let workspace = Workspace {
        id: Uuid::new_v4(),
        name: "tiny".into(),
        webhook_secret: "s".into(),
        verify_token: "v".into(),
        rate_limit: None,
        created_at: chrono::Utc::now(),
    };
    workspaces.insert(workspace.clone()).await.unwrap();
    let state = IngestState {
        workspaces,
        dedupe: Arc::new(MemoryDedupe::new()),
        queues: WebhookQueues::in_memory(Duration::from_secs(30)),
        max_body_bytes: 64,
        dedupe_ttl: Duration::from_secs(3600),
    };
    let router = webhook_router(state);

    let raw = vec![b'x'; 200];
    let signature = sign(&raw, "s");
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/webhook/{}", workspace.id))
        .header("x-hub-signature-256", signature)
        .body(Body::from(raw))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_replayed_event_enqueues_once() {
    let rig = rig().await;
    let body = status_body("wamid.REPLAY", "delivered");

    assert_eq!(post_signed(&rig, &body, "wh-secret").await, StatusCode::OK);
    assert_eq!(post_signed(&rig, &body, "wh-secret").await, StatusCode::OK);

    assert_eq!(rig.queues.statuses.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_status_receipt_advances_message_and_counts_once() {
    let rig = rig().await;

    // An outbound message already handed to the upstream.
    let mut msg = Message::outbound(
        rig.workspace.id,
        "104".into(),
        MessageKind::Text,
        "15551234567".into(),
        json!({}),
        None,
    );
    msg.status = MessageStatus::Sent;
    msg.upstream_message_id = Some("wamid.S1".into());
    let message_id = msg.id;
    rig.messages.insert(msg).await.unwrap();

    let events = capture_sink();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handler = StatusHandler {
        messages: rig.messages.clone(),
        events: events.clone(),
        grace: Duration::from_millis(50),
    };
    tokio::spawn(handler.run(rig.queues.statuses.clone(), shutdown_rx));

    // Delivered receipt, twice (upstream retry).
    let body = status_body("wamid.S1", "delivered");
    post_signed(&rig, &body, "wh-secret").await;
    post_signed(&rig, &body, "wh-secret").await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let row = rig.messages.get(message_id).await.unwrap().unwrap();
    assert_eq!(row.status, MessageStatus::Delivered);
    assert!(row.delivered_at.is_some());
    assert_eq!(events.count_transition(DeliveryTransition::Delivered), 1);
    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_out_of_order_read_then_delivered() {
    let rig = rig().await;

    let mut msg = Message::outbound(
        rig.workspace.id,
        "104".into(),
        MessageKind::Text,
        "15551234567".into(),
        json!({}),
        None,
    );
    msg.status = MessageStatus::Sent;
    msg.upstream_message_id = Some("wamid.OOO".into());
    let message_id = msg.id;
    rig.messages.insert(msg).await.unwrap();

    let events = capture_sink();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handler = StatusHandler {
        messages: rig.messages.clone(),
        events: events.clone(),
        grace: Duration::from_millis(50),
    };
    tokio::spawn(handler.run(rig.queues.statuses.clone(), shutdown_rx));

    // Read arrives before Delivered.
    post_signed(&rig, &status_body("wamid.OOO", "read"), "wh-secret").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    post_signed(&rig, &status_body("wamid.OOO", "delivered"), "wh-secret").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let row = rig.messages.get(message_id).await.unwrap().unwrap();
    // Read wins; the late Delivered receipt is stale and dropped.
    assert_eq!(row.status, MessageStatus::Read);
    assert!(row.delivered_at.is_some());
    assert_eq!(events.count_transition(DeliveryTransition::Read), 1);
    assert_eq!(events.count_transition(DeliveryTransition::Delivered), 0);
    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_inbound_message_creates_contact_and_row() {
    let rig = rig().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handler = InboundHandler {
        messages: rig.messages.clone(),
        contacts: rig.contacts.clone(),
    };
    tokio::spawn(handler.run(rig.queues.inbound.clone(), shutdown_rx));

    let body = json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "9000001",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": { "phone_number_id": "104", "display_phone_number": "15550001111" },
                    "contacts": [{ "wa_id": "15551234567", "profile": { "name": "Ada" } }],
                    "messages": [{
                        "id": "wamid.INBOUND1",
                        "from": "15551234567",
                        "timestamp": "1700000000",
                        "type": "image",
                        "image": { "id": "MEDIA-9", "mime_type": "image/jpeg" },
                    }],
                },
            }],
        }],
    });
    post_signed(&rig, &body, "wh-secret").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let row = rig
        .messages
        .find_by_upstream_id("wamid.INBOUND1")
        .await
        .unwrap()
        .expect("inbound message persisted");
    assert_eq!(row.direction, MessageDirection::Inbound);
    assert_eq!(row.kind, MessageKind::Media);
    assert_eq!(row.peer, "15551234567");
    // Media stays an opaque upstream reference.
    assert_eq!(row.payload["image"]["id"], "MEDIA-9");

    let contact = rig
        .contacts
        .resolve_or_create(rig.workspace.id, "15551234567", None)
        .await
        .unwrap();
    assert_eq!(contact.profile_name.as_deref(), Some("Ada"));
    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_unknown_workspace_is_404() {
    let rig = rig().await;
    let body = status_body("wamid.X", "sent");
    let raw = serde_json::to_vec(&body).unwrap();
    let signature = sign(&raw, "wh-secret");
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/webhook/{}", Uuid::new_v4()))
        .header("x-hub-signature-256", signature)
        .body(Body::from(raw))
        .unwrap();
    let response = rig.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
