use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        Query,
    },
    http::StatusCode as HttpStatus,
    response::{IntoResponse, Response as AxumResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use shared::domain::ChatId;
use std::collections::HashMap;

const GOOD_CREDENTIALS: &[u8] = b"device-credentials";

async fn connect_handler(Json(body): Json<serde_json::Value>) -> AxumResponse {
    match body.get("credentials_b64").and_then(|v| v.as_str()) {
        None => Json(json!({ "status": "pairing", "code": "ABCD-1234" })).into_response(),
        Some(encoded) if encoded == STANDARD.encode(GOOD_CREDENTIALS) => Json(json!({
            "status": "authenticated",
            "own_id": "10000000000@s.whatsapp.net"
        }))
        .into_response(),
        Some(_) => (HttpStatus::UNAUTHORIZED, "device revoked").into_response(),
    }
}

async fn events_handler(ws: WebSocketUpgrade) -> AxumResponse {
    ws.on_upgrade(|mut socket| async move {
        let frames = [
            json!({ "kind": "event", "event": { "type": "contact", "payload": { "contact_id": "1@s.whatsapp.net" } } }),
            json!({ "kind": "bogus" }),
            json!({
                "kind": "paired",
                "own_id": "10000000000@s.whatsapp.net",
                "credentials_b64": STANDARD.encode(GOOD_CREDENTIALS)
            }),
        ];
        for frame in frames {
            if socket
                .send(WsMessage::Text(frame.to_string()))
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = socket.send(WsMessage::Close(None)).await;
    })
}

async fn send_handler(Json(payload): Json<OutboundPayload>) -> AxumResponse {
    match payload {
        OutboundPayload::Text { text, .. } if text == "reject" => {
            (HttpStatus::BAD_REQUEST, "unknown recipient").into_response()
        }
        OutboundPayload::Text { text, .. } if text == "offline" => {
            HttpStatus::SERVICE_UNAVAILABLE.into_response()
        }
        _ => Json(SendAck {
            message_id: "3EB0ABCDEF".into(),
            timestamp: Utc::now(),
        })
        .into_response(),
    }
}

async fn upload_handler(Query(params): Query<HashMap<String, String>>, body: String) -> AxumResponse {
    Json(json!({
        "url": format!("/media/{}/{}", params.get("kind").cloned().unwrap_or_default(), body.len()),
        "direct_path": "/direct/1"
    }))
    .into_response()
}

async fn spawn_gateway() -> String {
    let app = Router::new()
        .route("/session/connect", post(connect_handler))
        .route("/session/events", get(events_handler))
        .route("/session/disconnect", post(|| async { HttpStatus::NO_CONTENT }))
        .route("/send", post(send_handler))
        .route("/media/upload", post(upload_handler))
        .route("/media/blob", get(|| async { vec![9u8, 8, 7] }))
        .route(
            "/media/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(600)).await;
                vec![1u8, 2, 3]
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn transport(base_url: String) -> GatewayTransport {
    GatewayTransport::new(GatewayOptions {
        base_url,
        request_timeout: Duration::from_secs(5),
        media_timeout: Duration::from_secs(5),
        event_capacity: 16,
    })
    .expect("transport")
}

fn text(body: &str) -> OutboundPayload {
    OutboundPayload::Text {
        chat_id: ChatId::from("15550001@s.whatsapp.net"),
        text: body.to_string(),
        quoted: None,
    }
}

#[test]
fn rejects_non_http_base_urls() {
    assert!(GatewayTransport::new(GatewayOptions {
        base_url: "ftp://gateway".to_string(),
        request_timeout: Duration::from_secs(1),
        media_timeout: Duration::from_secs(1),
        event_capacity: 1,
    })
    .is_err());
}

#[test]
fn derives_websocket_url_from_base() {
    let gateway = transport("https://gateway.local:8443/".to_string());
    assert_eq!(
        gateway.events_url().expect("url").as_str(),
        "wss://gateway.local:8443/session/events"
    );
}

#[tokio::test]
async fn pairing_flow_streams_frames_until_close() {
    let gateway = transport(spawn_gateway().await);
    let mut connection = gateway.connect(None).await.expect("connect");
    assert_eq!(
        connection.outcome,
        ConnectOutcome::PairingRequired {
            code: "ABCD-1234".to_string()
        }
    );

    let first = connection.events.recv().await.expect("protocol event");
    assert!(matches!(first, TransportEvent::Protocol(_)));
    let second = connection.events.recv().await.expect("paired event");
    assert_eq!(
        second,
        TransportEvent::Paired {
            own_id: "10000000000@s.whatsapp.net".into(),
            credentials: GOOD_CREDENTIALS.to_vec(),
        }
    );
    let last = connection.events.recv().await.expect("disconnect event");
    assert!(matches!(last, TransportEvent::Disconnected { .. }));

    gateway.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn maps_connect_rejections() {
    let gateway = transport(spawn_gateway().await);
    let result = gateway.connect(Some(&b"stale"[..])).await;
    assert_eq!(
        result.map(|c| c.outcome),
        Err(ConnectError::AuthRejected("device revoked".to_string()))
    );

    let connection = gateway
        .connect(Some(GOOD_CREDENTIALS))
        .await
        .expect("connect");
    assert!(matches!(
        connection.outcome,
        ConnectOutcome::Authenticated { .. }
    ));
}

#[tokio::test]
async fn maps_send_statuses() {
    let gateway = transport(spawn_gateway().await);

    let ack = gateway.send(&text("hello")).await.expect("ack");
    assert_eq!(ack.message_id.as_str(), "3EB0ABCDEF");
    assert!(matches!(
        gateway.send(&text("reject")).await,
        Err(SendError::Rejected(_))
    ));
    assert_eq!(
        gateway.send(&text("offline")).await,
        Err(SendError::NotConnected)
    );
}

#[tokio::test]
async fn uploads_and_fetches_relative_media_urls() {
    let gateway = transport(spawn_gateway().await);
    let uploaded = gateway
        .upload_media(ContentKind::Audio, b"abcd".to_vec())
        .await
        .expect("upload");
    assert_eq!(uploaded.url, "/media/audio/4");

    let descriptor = MediaDescriptor {
        url: "/media/blob".to_string(),
        direct_path: None,
        media_key_b64: String::new(),
        file_sha256_b64: None,
        file_enc_sha256_b64: None,
        mime_type: None,
        file_name: None,
        file_length: None,
    };
    assert_eq!(
        gateway.fetch_media(&descriptor).await.expect("fetch"),
        vec![9, 8, 7]
    );
}

fn blob(url: &str) -> MediaDescriptor {
    MediaDescriptor {
        url: url.to_string(),
        direct_path: None,
        media_key_b64: String::new(),
        file_sha256_b64: None,
        file_enc_sha256_b64: None,
        mime_type: None,
        file_name: None,
        file_length: None,
    }
}

#[tokio::test]
async fn media_transfers_use_their_own_timeout() {
    let base_url = spawn_gateway().await;
    let gateway = GatewayTransport::new(GatewayOptions {
        base_url: base_url.clone(),
        request_timeout: Duration::from_millis(200),
        media_timeout: Duration::from_secs(5),
        event_capacity: 4,
    })
    .expect("transport");
    assert_eq!(
        gateway.fetch_media(&blob("/media/slow")).await.expect("fetch"),
        vec![1, 2, 3]
    );

    let impatient = GatewayTransport::new(GatewayOptions {
        base_url,
        request_timeout: Duration::from_secs(5),
        media_timeout: Duration::from_millis(200),
        event_capacity: 4,
    })
    .expect("transport");
    assert_eq!(
        impatient.fetch_media(&blob("/media/slow")).await,
        Err(SendError::Transport("request timed out".to_string()))
    );
}

#[tokio::test]
async fn unreachable_gateway_is_unavailable() {
    let gateway = transport("http://127.0.0.1:9".to_string());
    assert!(matches!(
        gateway.connect(None).await.map(|c| c.outcome),
        Err(ConnectError::Unavailable(_))
    ));
}
