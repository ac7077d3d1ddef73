use thiserror::Error;

use shared::{
    domain::{ChatId, MessageId},
    error::{ApiError, ErrorCode},
};
use storage::StoreConflict;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no connected session: {0}")]
    SessionUnavailable(String),
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),
    #[error("remote rejected the request: {0}")]
    TransportRejected(String),
    #[error("media fetch failed: {0}")]
    MediaFetchFailed(String),
    #[error("media encoding unavailable: {0}")]
    MediaEncodeUnavailable(String),
    #[error(transparent)]
    StoreConflict(#[from] StoreConflict),
    #[error("session lost, pairing required: {0}")]
    PersistentAuthLoss(String),
    #[error("message {message_id} not found in chat {chat_id}")]
    MessageNotFound {
        chat_id: ChatId,
        message_id: MessageId,
    },
    #[error("message {0} carries no media")]
    NoMedia(MessageId),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SessionUnavailable(_) => ErrorCode::SessionUnavailable,
            Self::UnknownRecipient(_) => ErrorCode::UnknownRecipient,
            Self::TransportRejected(_) => ErrorCode::TransportRejected,
            Self::MediaFetchFailed(_) => ErrorCode::MediaFetchFailed,
            Self::MediaEncodeUnavailable(_) => ErrorCode::MediaEncodeUnavailable,
            Self::PersistentAuthLoss(_) => ErrorCode::PersistentAuthLoss,
            Self::MessageNotFound { .. } | Self::NoMedia(_) => ErrorCode::NotFound,
            Self::Validation(_) => ErrorCode::Validation,
            Self::StoreConflict(_) | Self::Store(_) => ErrorCode::Internal,
        }
    }

    pub fn to_api_error(&self) -> ApiError {
        ApiError::new(self.code(), self.to_string())
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<StoreConflict>() {
            Some(conflict) => Self::StoreConflict(conflict.clone()),
            None => Self::Store(err),
        }
    }
}
