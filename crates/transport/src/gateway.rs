//! Client for a protocol gateway process that owns the actual multi-device
//! session. Commands go over HTTP, inbound events arrive on a WebSocket.

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use shared::{
    domain::ContentKind,
    protocol::{MediaDescriptor, OutboundPayload, SendAck, UploadedMedia},
};

use crate::{
    ConnectError, ConnectOutcome, ProtocolTransport, SendError, TransportConnection,
    TransportEvent,
};

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub base_url: String,
    /// Bounds session control calls and text sends.
    pub request_timeout: Duration,
    /// Bounds media uploads and downloads.
    pub media_timeout: Duration,
    pub event_capacity: usize,
}

pub struct GatewayTransport {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
    media_timeout: Duration,
    event_capacity: usize,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Serialize)]
struct ConnectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    credentials_b64: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ConnectResponse {
    Authenticated { own_id: String },
    Pairing { code: String },
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum GatewayFrame {
    Event { event: serde_json::Value },
    Paired { own_id: String, credentials_b64: String },
    LoggedOut { reason: String },
}

impl GatewayTransport {
    pub fn new(options: GatewayOptions) -> anyhow::Result<Self> {
        let base = format!("{}/", options.base_url.trim_end_matches('/'));
        let base_url =
            Url::parse(&base).with_context(|| format!("invalid gateway url: {base}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            bail!("gateway url must start with http:// or https://");
        }
        let http = Client::builder()
            .connect_timeout(options.request_timeout)
            .build()
            .context("failed to build gateway http client")?;
        Ok(Self {
            http,
            base_url,
            request_timeout: options.request_timeout,
            media_timeout: options.media_timeout,
            event_capacity: options.event_capacity.max(1),
            reader: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> anyhow::Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid gateway path: {path}"))
    }

    fn events_url(&self) -> anyhow::Result<Url> {
        let mut url = self.endpoint("session/events")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {url}"))?;
        Ok(url)
    }

    fn media_url(&self, media: &MediaDescriptor) -> anyhow::Result<Url> {
        match Url::parse(&media.url) {
            Ok(url) => Ok(url),
            Err(_) => self.endpoint(media.url.trim_start_matches('/')),
        }
    }
}

#[async_trait]
impl ProtocolTransport for GatewayTransport {
    async fn connect(
        &self,
        credentials: Option<&[u8]>,
    ) -> Result<TransportConnection, ConnectError> {
        let unavailable = |err: anyhow::Error| ConnectError::Unavailable(err.to_string());
        let request = ConnectRequest {
            credentials_b64: credentials.map(|credentials| STANDARD.encode(credentials)),
        };
        let response = self
            .http
            .post(self.endpoint("session/connect").map_err(unavailable)?)
            .timeout(self.request_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|err| ConnectError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectError::AuthRejected(body));
        }
        if !status.is_success() {
            return Err(ConnectError::Unavailable(format!(
                "gateway answered {status}"
            )));
        }
        let outcome = match response.json::<ConnectResponse>().await {
            Ok(ConnectResponse::Authenticated { own_id }) => ConnectOutcome::Authenticated {
                own_id: own_id.into(),
            },
            Ok(ConnectResponse::Pairing { code }) => ConnectOutcome::PairingRequired { code },
            Err(err) => {
                return Err(ConnectError::Unavailable(format!(
                    "invalid connect response: {err}"
                )))
            }
        };

        let events_url = self.events_url().map_err(unavailable)?;
        let (ws_stream, _) = connect_async(events_url.as_str())
            .await
            .map_err(|err| ConnectError::Unavailable(format!("event stream: {err}")))?;
        let (tx, rx) = mpsc::channel(self.event_capacity);
        let reader = tokio::spawn(forward_frames(ws_stream, tx));
        if let Some(previous) = self.reader.lock().await.replace(reader) {
            previous.abort();
        }
        info!(url = %self.base_url, "gateway session connected");

        Ok(TransportConnection {
            outcome,
            events: rx,
        })
    }

    async fn send(&self, payload: &OutboundPayload) -> Result<SendAck, SendError> {
        let url = self
            .endpoint("send")
            .map_err(|err| SendError::Transport(err.to_string()))?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .await
            .map_err(request_error)?;
        check_status(response)
            .await?
            .json::<SendAck>()
            .await
            .map_err(|err| SendError::Transport(format!("invalid send ack: {err}")))
    }

    async fn upload_media(
        &self,
        kind: ContentKind,
        encrypted: Vec<u8>,
    ) -> Result<UploadedMedia, SendError> {
        let url = self
            .endpoint("media/upload")
            .map_err(|err| SendError::Transport(err.to_string()))?;
        let response = self
            .http
            .post(url)
            .timeout(self.media_timeout)
            .query(&[("kind", kind.as_str())])
            .body(encrypted)
            .send()
            .await
            .map_err(request_error)?;
        check_status(response)
            .await?
            .json::<UploadedMedia>()
            .await
            .map_err(|err| SendError::Transport(format!("invalid upload response: {err}")))
    }

    async fn fetch_media(&self, media: &MediaDescriptor) -> Result<Vec<u8>, SendError> {
        let url = self
            .media_url(media)
            .map_err(|err| SendError::Transport(err.to_string()))?;
        let response = self
            .http
            .get(url)
            .timeout(self.media_timeout)
            .send()
            .await
            .map_err(request_error)?;
        let bytes = check_status(response)
            .await?
            .bytes()
            .await
            .map_err(request_error)?;
        Ok(bytes.to_vec())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        let result = self
            .http
            .post(self.endpoint("session/disconnect")?)
            .timeout(self.request_timeout)
            .send()
            .await;
        if let Err(err) = result {
            debug!(error = %err, "gateway disconnect request failed");
        }
        Ok(())
    }
}

async fn forward_frames<S>(mut frames: S, events: mpsc::Sender<TransportEvent>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let reason = loop {
        match frames.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "ignoring malformed gateway frame");
                        continue;
                    }
                };
                let Some(event) = frame_to_event(frame) else {
                    continue;
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|frame| frame.reason.to_string())
                    .filter(|reason| !reason.is_empty())
                    .unwrap_or_else(|| "closed by gateway".to_string());
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => break err.to_string(),
            None => break "event stream ended".to_string(),
        }
    };
    let _ = events.send(TransportEvent::Disconnected { reason }).await;
}

fn frame_to_event(frame: GatewayFrame) -> Option<TransportEvent> {
    match frame {
        GatewayFrame::Event { event } => Some(TransportEvent::Protocol(event)),
        GatewayFrame::Paired {
            own_id,
            credentials_b64,
        } => match STANDARD.decode(credentials_b64.as_bytes()) {
            Ok(credentials) => Some(TransportEvent::Paired {
                own_id: own_id.into(),
                credentials,
            }),
            Err(err) => {
                warn!(error = %err, "gateway sent undecodable credentials");
                None
            }
        },
        GatewayFrame::LoggedOut { reason } => Some(TransportEvent::LoggedOut { reason }),
    }
}

async fn check_status(response: Response) -> Result<Response, SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(if status == StatusCode::SERVICE_UNAVAILABLE {
        SendError::NotConnected
    } else if status.is_client_error() {
        SendError::Rejected(format!("{status}: {body}"))
    } else {
        SendError::Transport(format!("{status}: {body}"))
    })
}

fn request_error(err: reqwest::Error) -> SendError {
    if err.is_timeout() {
        SendError::Transport("request timed out".to_string())
    } else {
        SendError::Transport(err.to_string())
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
