use super::*;
use shared::domain::ChatId;

const OWN_ID: &str = "10000000000@s.whatsapp.net";

fn text(chat: &str, body: &str) -> OutboundPayload {
    OutboundPayload::Text {
        chat_id: ChatId::from(chat),
        text: body.to_string(),
        quoted: None,
    }
}

#[tokio::test]
async fn connect_without_credentials_requires_pairing() {
    let transport = LoopbackTransport::new(OWN_ID);
    let mut connection = transport.connect(None).await.expect("connect");
    assert!(matches!(
        connection.outcome,
        ConnectOutcome::PairingRequired { .. }
    ));
    assert_eq!(
        transport.send(&text("1@s.whatsapp.net", "hi")).await,
        Err(SendError::NotConnected)
    );

    assert!(transport.complete_pairing().await);
    let event = connection.events.recv().await.expect("paired event");
    assert_eq!(
        event,
        TransportEvent::Paired {
            own_id: ContactId::from(OWN_ID),
            credentials: transport.credentials(),
        }
    );
    transport
        .send(&text("1@s.whatsapp.net", "hi"))
        .await
        .expect("send after pairing");
}

#[tokio::test]
async fn rejects_unknown_credentials_and_accepts_issued_ones() {
    let transport = LoopbackTransport::new(OWN_ID);
    assert!(matches!(
        transport.connect(Some(&b"stale"[..])).await,
        Err(ConnectError::AuthRejected(_))
    ));

    transport.accept_credentials().await;
    let credentials = transport.credentials();
    let connection = transport
        .connect(Some(credentials.as_slice()))
        .await
        .expect("connect");
    assert_eq!(
        connection.outcome,
        ConnectOutcome::Authenticated {
            own_id: ContactId::from(OWN_ID)
        }
    );
}

#[tokio::test]
async fn injected_failures_are_consumed_in_order() {
    let transport = LoopbackTransport::new(OWN_ID);
    transport.accept_credentials().await;
    transport.fail_next_connects(1).await;
    let credentials = transport.credentials();

    assert!(transport.connect(Some(credentials.as_slice())).await.is_err());
    let _connection = transport
        .connect(Some(credentials.as_slice()))
        .await
        .expect("second connect");
    assert_eq!(transport.connect_count().await, 2);

    transport.fail_next_sends(1).await;
    assert!(matches!(
        transport.send(&text("1@s.whatsapp.net", "a")).await,
        Err(SendError::Transport(_))
    ));
    transport
        .send(&text("1@s.whatsapp.net", "b"))
        .await
        .expect("second send");
    assert_eq!(transport.sent_payloads().await.len(), 1);
}

#[tokio::test]
async fn echo_replays_sends_as_own_messages() {
    let transport = LoopbackTransport::new(OWN_ID).with_echo();
    transport.accept_credentials().await;
    let credentials = transport.credentials();
    let mut connection = transport
        .connect(Some(credentials.as_slice()))
        .await
        .expect("connect");

    let ack = transport
        .send(&text("1@s.whatsapp.net", "ping"))
        .await
        .expect("send");
    let TransportEvent::Protocol(value) = connection.events.recv().await.expect("echo") else {
        panic!("expected a protocol event");
    };
    let echoed: WireEvent = serde_json::from_value(value).expect("wire event");
    let WireEvent::Message {
        message_id,
        from_me,
        text,
        ..
    } = echoed
    else {
        panic!("expected a message echo");
    };
    assert_eq!(message_id, ack.message_id.to_string());
    assert!(from_me);
    assert_eq!(text.as_deref(), Some("ping"));
}

#[tokio::test]
async fn uploaded_blobs_can_be_fetched_back() {
    let transport = LoopbackTransport::new(OWN_ID).with_auto_pairing();
    let _connection = transport.connect(None).await.expect("connect");

    let uploaded = transport
        .upload_media(ContentKind::Image, vec![1, 2, 3])
        .await
        .expect("upload");
    let descriptor = MediaDescriptor {
        url: uploaded.url,
        direct_path: uploaded.direct_path,
        media_key_b64: String::new(),
        file_sha256_b64: None,
        file_enc_sha256_b64: None,
        mime_type: None,
        file_name: None,
        file_length: None,
    };

    assert_eq!(
        transport.fetch_media(&descriptor).await.expect("fetch"),
        vec![1, 2, 3]
    );
    assert_eq!(transport.fetch_count().await, 1);
}

#[tokio::test]
async fn dropping_the_connection_ends_the_stream() {
    let transport = LoopbackTransport::new(OWN_ID);
    transport.accept_credentials().await;
    let credentials = transport.credentials();
    let mut connection = transport
        .connect(Some(credentials.as_slice()))
        .await
        .expect("connect");

    transport.drop_connection("network blip").await;
    assert_eq!(
        connection.events.recv().await,
        Some(TransportEvent::Disconnected {
            reason: "network blip".to_string()
        })
    );
    assert_eq!(connection.events.recv().await, None);
    assert!(!transport.is_connected().await);
}
