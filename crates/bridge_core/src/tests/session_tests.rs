use super::*;
use serde_json::json;
use shared::domain::ChatId;
use transport::LoopbackTransport;

const OWN_ID: &str = "10000000000@s.whatsapp.net";

fn fast_options() -> SessionOptions {
    SessionOptions {
        send_timeout: Duration::from_secs(2),
        media_timeout: Duration::from_secs(2),
        event_capacity: 16,
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: 3,
        },
    }
}

async fn paired_loopback() -> (Arc<LoopbackTransport>, Arc<MemoryCredentialStore>) {
    let transport = Arc::new(LoopbackTransport::new(OWN_ID));
    transport.accept_credentials().await;
    let credentials = Arc::new(MemoryCredentialStore::with_credentials(
        transport.credentials(),
    ));
    (transport, credentials)
}

async fn wait_for_state(
    manager: &SessionManager,
    predicate: impl Fn(&SessionState) -> bool,
) -> SessionState {
    let mut states = manager.subscribe_state();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = states.borrow_and_update().clone();
            if predicate(&current) {
                return current;
            }
            states.changed().await.expect("state sender alive");
        }
    })
    .await;
    waited.expect("state reached in time")
}

fn text(body: &str) -> OutboundPayload {
    OutboundPayload::Text {
        chat_id: ChatId::from("15550001@s.whatsapp.net"),
        text: body.to_string(),
        quoted: None,
    }
}

#[test]
fn backoff_doubles_until_the_cap() {
    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(350),
        max_attempts: 5,
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    assert_eq!(policy.delay_for(40), Duration::from_millis(350));
}

#[tokio::test]
async fn stored_credentials_resume_the_session() {
    let (transport, credentials) = paired_loopback().await;
    let manager = SessionManager::new(transport, credentials, fast_options());

    let state = manager.connect().await.expect("connect");
    assert_eq!(
        state,
        SessionState::Connected {
            own_id: ContactId::from(OWN_ID)
        }
    );
    assert_eq!(manager.own_id(), Some(ContactId::from(OWN_ID)));
    manager.shutdown().await;
    assert_eq!(manager.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn pairing_persists_issued_credentials() {
    let transport = Arc::new(LoopbackTransport::new(OWN_ID));
    let credentials = Arc::new(MemoryCredentialStore::default());
    let manager = SessionManager::new(transport.clone(), credentials.clone(), fast_options());

    let state = manager.connect().await.expect("connect");
    assert!(matches!(state, SessionState::Pairing { .. }));
    assert!(matches!(
        manager.send(&text("hi")).await,
        Err(BridgeError::SessionUnavailable(_))
    ));

    transport.complete_pairing().await;
    wait_for_state(&manager, |s| matches!(s, SessionState::Connected { .. })).await;
    assert_eq!(
        credentials.load().await.expect("load"),
        Some(transport.credentials())
    );
    manager.shutdown().await;
}

#[tokio::test]
async fn rejected_credentials_are_cleared_before_pairing() {
    let transport = Arc::new(LoopbackTransport::new(OWN_ID));
    let credentials = Arc::new(MemoryCredentialStore::with_credentials(b"stale".to_vec()));
    let manager = SessionManager::new(transport, credentials.clone(), fast_options());

    let state = manager.connect().await.expect("connect");
    assert!(matches!(state, SessionState::Pairing { .. }));
    assert_eq!(credentials.load().await.expect("load"), None);
    manager.shutdown().await;
}

#[tokio::test]
async fn events_keep_flowing_through_one_queue_across_reconnects() {
    let (transport, credentials) = paired_loopback().await;
    let manager = SessionManager::new(transport.clone(), credentials, fast_options());
    manager.connect().await.expect("connect");
    let mut events = manager.take_events().await.expect("event queue");
    assert!(manager.take_events().await.is_none());

    assert!(transport.push_raw_event(json!({ "seq": 1 })).await);
    assert_eq!(events.recv().await, Some(json!({ "seq": 1 })));

    transport.drop_connection("network blip").await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.connect_count().await < 2 || !transport.is_connected().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reconnected in time");
    wait_for_state(&manager, |s| matches!(s, SessionState::Connected { .. })).await;

    assert!(transport.push_raw_event(json!({ "seq": 2 })).await);
    assert_eq!(events.recv().await, Some(json!({ "seq": 2 })));
    manager.shutdown().await;
}

#[tokio::test]
async fn exhausted_reconnects_escalate_to_auth_loss() {
    let (transport, credentials) = paired_loopback().await;
    let manager = SessionManager::new(transport.clone(), credentials, fast_options());
    manager.connect().await.expect("connect");

    transport.fail_next_connects(10).await;
    transport.drop_connection("gateway crashed").await;
    let state = wait_for_state(&manager, |s| matches!(s, SessionState::LoggedOut { .. })).await;
    assert!(matches!(state, SessionState::LoggedOut { .. }));

    assert!(matches!(
        manager.send(&text("hi")).await,
        Err(BridgeError::PersistentAuthLoss(_))
    ));
    assert!(matches!(
        manager.connect().await,
        Err(BridgeError::PersistentAuthLoss(_))
    ));
}

#[tokio::test]
async fn remote_logout_is_terminal_and_forgets_credentials() {
    let (transport, credentials) = paired_loopback().await;
    let manager = SessionManager::new(transport.clone(), credentials.clone(), fast_options());
    manager.connect().await.expect("connect");

    transport.log_out("device removed").await;
    let state = wait_for_state(&manager, |s| matches!(s, SessionState::LoggedOut { .. })).await;
    assert_eq!(
        state,
        SessionState::LoggedOut {
            reason: "device removed".to_string()
        }
    );
    assert_eq!(credentials.load().await.expect("load"), None);
    manager.shutdown().await;
    assert!(matches!(manager.state(), SessionState::LoggedOut { .. }));
}

#[tokio::test]
async fn send_failures_map_to_transport_rejected() {
    let (transport, credentials) = paired_loopback().await;
    let manager = SessionManager::new(transport.clone(), credentials, fast_options());
    manager.connect().await.expect("connect");

    transport.fail_next_sends(1).await;
    assert!(matches!(
        manager.send(&text("first")).await,
        Err(BridgeError::TransportRejected(_))
    ));
    let ack = manager.send(&text("second")).await.expect("ack");
    assert!(ack.message_id.as_str().starts_with("LB"));
    manager.shutdown().await;
}

#[tokio::test]
async fn unreachable_remote_fails_connect() {
    let (transport, credentials) = paired_loopback().await;
    transport.fail_next_connects(1).await;
    let manager = SessionManager::new(transport, credentials, fast_options());

    assert!(matches!(
        manager.connect().await,
        Err(BridgeError::SessionUnavailable(_))
    ));
    assert_eq!(manager.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn file_credentials_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileCredentialStore::new(dir.path().join("nested").join("session.bin"));

    assert_eq!(store.load().await.expect("empty load"), None);
    store.save(b"blob").await.expect("save");
    assert_eq!(store.load().await.expect("load"), Some(b"blob".to_vec()));
    store.clear().await.expect("clear");
    store.clear().await.expect("clear twice");
    assert_eq!(store.load().await.expect("load after clear"), None);
}

/// Connects slowly and keeps every event stream open.
struct SlowConnectTransport {
    delay: Duration,
    streams: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    disconnects: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl ProtocolTransport for SlowConnectTransport {
    async fn connect(
        &self,
        _credentials: Option<&[u8]>,
    ) -> std::result::Result<TransportConnection, ConnectError> {
        tokio::time::sleep(self.delay).await;
        let (tx, rx) = mpsc::channel(4);
        self.streams.lock().await.push(tx);
        Ok(TransportConnection {
            outcome: ConnectOutcome::Authenticated {
                own_id: ContactId::from(OWN_ID),
            },
            events: rx,
        })
    }

    async fn send(&self, _payload: &OutboundPayload) -> std::result::Result<SendAck, SendError> {
        Err(SendError::NotConnected)
    }

    async fn upload_media(
        &self,
        _kind: ContentKind,
        _encrypted: Vec<u8>,
    ) -> std::result::Result<UploadedMedia, SendError> {
        Err(SendError::NotConnected)
    }

    async fn fetch_media(
        &self,
        _media: &MediaDescriptor,
    ) -> std::result::Result<Vec<u8>, SendError> {
        Err(SendError::NotConnected)
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_during_connect_does_not_hang() {
    let transport = Arc::new(SlowConnectTransport {
        delay: Duration::from_millis(200),
        streams: Mutex::new(Vec::new()),
        disconnects: std::sync::atomic::AtomicU32::new(0),
    });
    let manager = SessionManager::new(
        transport.clone(),
        Arc::new(MemoryCredentialStore::with_credentials(b"creds".to_vec())),
        fast_options(),
    );

    let connecting = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(3), manager.shutdown())
        .await
        .expect("shutdown finished while connect was in flight");
    let connected = connecting.await.expect("connect task");
    assert!(matches!(
        connected,
        Err(BridgeError::SessionUnavailable(_))
    ));
    assert_eq!(manager.state(), SessionState::Disconnected);
    assert!(
        transport
            .disconnects
            .load(std::sync::atomic::Ordering::SeqCst)
            >= 1
    );
    assert!(matches!(
        manager.connect().await,
        Err(BridgeError::SessionUnavailable(_))
    ));
}
