//! In-process transport. Serves as the session in tests and in local
//! development, where there is no protocol gateway to talk to.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use shared::{
    domain::{ContactId, ContentKind},
    protocol::{MediaDescriptor, OutboundPayload, SendAck, UploadedMedia, WireEvent},
};

use crate::{
    ConnectError, ConnectOutcome, ProtocolTransport, SendError, TransportConnection,
    TransportEvent,
};

const DEFAULT_EVENT_CAPACITY: usize = 256;

pub struct LoopbackTransport {
    own_id: ContactId,
    event_capacity: usize,
    auto_pair: bool,
    echo_sends: bool,
    state: Mutex<LoopbackState>,
}

#[derive(Default)]
struct LoopbackState {
    accepted_credentials: Option<Vec<u8>>,
    events: Option<mpsc::Sender<TransportEvent>>,
    authenticated: bool,
    connect_count: u32,
    failing_connects: u32,
    failing_sends: u32,
    sent: Vec<OutboundPayload>,
    blobs: HashMap<String, Vec<u8>>,
    fetch_count: u32,
    next_id: u64,
}

impl LoopbackTransport {
    pub fn new(own_id: impl Into<ContactId>) -> Self {
        Self {
            own_id: own_id.into(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            auto_pair: false,
            echo_sends: false,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Completes pairing on its own right after a credential-less connect.
    pub fn with_auto_pairing(mut self) -> Self {
        self.auto_pair = true;
        self
    }

    /// Replays every accepted text send back through the event stream, the
    /// way the remote service echoes a device's own messages.
    pub fn with_echo(mut self) -> Self {
        self.echo_sends = true;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn own_id(&self) -> &ContactId {
        &self.own_id
    }

    /// The credential blob this transport hands out on pairing.
    pub fn credentials(&self) -> Vec<u8> {
        format!("loopback:{}", self.own_id).into_bytes()
    }

    /// Makes the remote accept the transport's own credentials without pairing.
    pub async fn accept_credentials(&self) {
        self.state.lock().await.accepted_credentials = Some(self.credentials());
    }

    pub async fn revoke_credentials(&self) {
        self.state.lock().await.accepted_credentials = None;
    }

    pub async fn complete_pairing(&self) -> bool {
        let credentials = self.credentials();
        let events = {
            let mut state = self.state.lock().await;
            state.accepted_credentials = Some(credentials.clone());
            state.authenticated = true;
            state.events.clone()
        };
        match events {
            Some(events) => events
                .send(TransportEvent::Paired {
                    own_id: self.own_id.clone(),
                    credentials,
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    pub async fn push_wire_event(&self, event: &WireEvent) -> bool {
        match serde_json::to_value(event) {
            Ok(value) => self.push_raw_event(value).await,
            Err(_) => false,
        }
    }

    /// Delivers an arbitrary protocol payload. Returns false when no
    /// connection is open.
    pub async fn push_raw_event(&self, value: serde_json::Value) -> bool {
        self.deliver(TransportEvent::Protocol(value)).await
    }

    /// Simulates a dropped connection; the open event stream ends.
    pub async fn drop_connection(&self, reason: &str) {
        self.deliver(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
        .await;
        let mut state = self.state.lock().await;
        state.events = None;
        state.authenticated = false;
    }

    /// Simulates the remote evicting this device.
    pub async fn log_out(&self, reason: &str) {
        self.deliver(TransportEvent::LoggedOut {
            reason: reason.to_string(),
        })
        .await;
        let mut state = self.state.lock().await;
        state.events = None;
        state.authenticated = false;
        state.accepted_credentials = None;
    }

    pub async fn fail_next_connects(&self, count: u32) {
        self.state.lock().await.failing_connects = count;
    }

    pub async fn fail_next_sends(&self, count: u32) {
        self.state.lock().await.failing_sends = count;
    }

    pub async fn insert_blob(&self, url: impl Into<String>, encrypted: Vec<u8>) {
        self.state.lock().await.blobs.insert(url.into(), encrypted);
    }

    pub async fn sent_payloads(&self) -> Vec<OutboundPayload> {
        self.state.lock().await.sent.clone()
    }

    pub async fn fetch_count(&self) -> u32 {
        self.state.lock().await.fetch_count
    }

    pub async fn connect_count(&self) -> u32 {
        self.state.lock().await.connect_count
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.authenticated
    }

    async fn deliver(&self, event: TransportEvent) -> bool {
        let events = self.state.lock().await.events.clone();
        match events {
            Some(events) => events.send(event).await.is_ok(),
            None => false,
        }
    }

    fn echo_event(&self, payload: &OutboundPayload, ack: &SendAck) -> Option<WireEvent> {
        match payload {
            OutboundPayload::Text {
                chat_id,
                text,
                quoted,
            } => Some(WireEvent::Message {
                chat_id: chat_id.to_string(),
                message_id: ack.message_id.to_string(),
                sender_id: self.own_id.to_string(),
                sender_name: None,
                chat_name: None,
                timestamp: ack.timestamp,
                from_me: true,
                kind: Some(ContentKind::Text),
                text: Some(text.clone()),
                quoted_message_id: quoted.as_ref().map(|q| q.message_id.to_string()),
                media: None,
            }),
            _ => None,
        }
    }
}

#[async_trait]
impl ProtocolTransport for LoopbackTransport {
    async fn connect(
        &self,
        credentials: Option<&[u8]>,
    ) -> Result<TransportConnection, ConnectError> {
        let (tx, rx) = mpsc::channel(self.event_capacity);
        let outcome = {
            let mut state = self.state.lock().await;
            state.connect_count += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(ConnectError::Unavailable(
                    "loopback connect failure".to_string(),
                ));
            }
            let outcome = match credentials {
                Some(presented) if state.accepted_credentials.as_deref() == Some(presented) => {
                    state.authenticated = true;
                    ConnectOutcome::Authenticated {
                        own_id: self.own_id.clone(),
                    }
                }
                Some(_) => {
                    return Err(ConnectError::AuthRejected(
                        "unknown device credentials".to_string(),
                    ))
                }
                None => {
                    state.authenticated = false;
                    ConnectOutcome::PairingRequired {
                        code: format!("LOOP-{:04}", state.connect_count),
                    }
                }
            };
            state.events = Some(tx);
            outcome
        };
        debug!(?outcome, "loopback transport connected");

        if self.auto_pair && matches!(outcome, ConnectOutcome::PairingRequired { .. }) {
            self.complete_pairing().await;
        }
        Ok(TransportConnection {
            outcome,
            events: rx,
        })
    }

    async fn send(&self, payload: &OutboundPayload) -> Result<SendAck, SendError> {
        let ack = {
            let mut state = self.state.lock().await;
            if !state.authenticated {
                return Err(SendError::NotConnected);
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(SendError::Transport("loopback send failure".to_string()));
            }
            state.next_id += 1;
            state.sent.push(payload.clone());
            SendAck {
                message_id: format!("LB{:016X}", state.next_id).into(),
                timestamp: Utc::now(),
            }
        };

        if self.echo_sends {
            if let Some(echo) = self.echo_event(payload, &ack) {
                self.push_wire_event(&echo).await;
            }
        }
        Ok(ack)
    }

    async fn upload_media(
        &self,
        kind: ContentKind,
        encrypted: Vec<u8>,
    ) -> Result<UploadedMedia, SendError> {
        let mut state = self.state.lock().await;
        if !state.authenticated {
            return Err(SendError::NotConnected);
        }
        state.next_id += 1;
        let direct_path = format!("/{kind}/{:016x}", state.next_id);
        let url = format!("loopback://media{direct_path}");
        state.blobs.insert(url.clone(), encrypted);
        Ok(UploadedMedia {
            url,
            direct_path: Some(direct_path),
        })
    }

    async fn fetch_media(&self, media: &MediaDescriptor) -> Result<Vec<u8>, SendError> {
        let mut state = self.state.lock().await;
        state.fetch_count += 1;
        state
            .blobs
            .get(&media.url)
            .cloned()
            .ok_or_else(|| SendError::Rejected(format!("no media at {}", media.url)))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.events = None;
        state.authenticated = false;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/loopback_tests.rs"]
mod tests;
