use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use shared::{
    domain::{ContactId, ContentKind},
    protocol::{MediaDescriptor, OutboundPayload, SendAck, UploadedMedia},
};

pub mod gateway;
pub mod loopback;

pub use gateway::{GatewayOptions, GatewayTransport};
pub use loopback::LoopbackTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Authenticated { own_id: ContactId },
    /// The remote wants a new device link; `code` is shown to the user.
    PairingRequired { code: String },
}

/// A live session: how it authenticated plus its inbound event stream.
/// The stream ends when the connection drops.
#[derive(Debug)]
pub struct TransportConnection {
    pub outcome: ConnectOutcome,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An untyped protocol event, classified later by ingestion.
    Protocol(serde_json::Value),
    Paired {
        own_id: ContactId,
        credentials: Vec<u8>,
    },
    LoggedOut {
        reason: String,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("credentials rejected: {0}")]
    AuthRejected(String),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("remote rejected the request: {0}")]
    Rejected(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

#[async_trait]
pub trait ProtocolTransport: Send + Sync {
    async fn connect(&self, credentials: Option<&[u8]>)
        -> Result<TransportConnection, ConnectError>;
    async fn send(&self, payload: &OutboundPayload) -> Result<SendAck, SendError>;
    /// Uploads an already encrypted blob.
    async fn upload_media(
        &self,
        kind: ContentKind,
        encrypted: Vec<u8>,
    ) -> Result<UploadedMedia, SendError>;
    /// Fetches the encrypted blob a descriptor points at.
    async fn fetch_media(&self, media: &MediaDescriptor) -> Result<Vec<u8>, SendError>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

/// Transport for read-only deployments: every session operation is refused.
pub struct MissingTransport;

#[async_trait]
impl ProtocolTransport for MissingTransport {
    async fn connect(
        &self,
        _credentials: Option<&[u8]>,
    ) -> Result<TransportConnection, ConnectError> {
        Err(ConnectError::Unavailable(
            "no protocol transport is configured".to_string(),
        ))
    }

    async fn send(&self, _payload: &OutboundPayload) -> Result<SendAck, SendError> {
        Err(SendError::NotConnected)
    }

    async fn upload_media(
        &self,
        _kind: ContentKind,
        _encrypted: Vec<u8>,
    ) -> Result<UploadedMedia, SendError> {
        Err(SendError::NotConnected)
    }

    async fn fetch_media(&self, _media: &MediaDescriptor) -> Result<Vec<u8>, SendError> {
        Err(SendError::NotConnected)
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_transport_refuses_everything() {
        let transport = MissingTransport;
        assert!(matches!(
            transport.connect(None).await,
            Err(ConnectError::Unavailable(_))
        ));
        let payload = OutboundPayload::Text {
            chat_id: "1@s.whatsapp.net".into(),
            text: "hi".to_string(),
            quoted: None,
        };
        assert_eq!(
            transport.send(&payload).await,
            Err(SendError::NotConnected)
        );
        transport.disconnect().await.expect("disconnect is a no-op");
    }
}
