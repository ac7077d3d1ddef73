use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, ContactId, ContentKind, DeliveryStatus, MessageId};

/// Remote location and key material of an encrypted media blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_path: Option<String>,
    pub media_key_b64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_sha256_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_enc_sha256_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedRef {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<ContactId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text {
        chat_id: ChatId,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quoted: Option<QuotedRef>,
    },
    Media {
        chat_id: ChatId,
        kind: ContentKind,
        media: MediaDescriptor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        #[serde(default)]
        voice_note: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quoted: Option<QuotedRef>,
    },
    Reaction {
        chat_id: ChatId,
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_sender: Option<ContactId>,
        emoji: String,
    },
}

impl OutboundPayload {
    pub fn chat_id(&self) -> &ChatId {
        match self {
            Self::Text { chat_id, .. }
            | Self::Media { chat_id, .. }
            | Self::Reaction { chat_id, .. } => chat_id,
        }
    }
}

/// Acknowledgement returned by the remote service for an accepted send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedMedia {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_path: Option<String>,
}

/// Inbound event as delivered by the transport, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireEvent {
    Message {
        chat_id: String,
        message_id: String,
        sender_id: String,
        #[serde(default)]
        sender_name: Option<String>,
        #[serde(default)]
        chat_name: Option<String>,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        from_me: bool,
        #[serde(default)]
        kind: Option<ContentKind>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        quoted_message_id: Option<String>,
        #[serde(default)]
        media: Option<MediaDescriptor>,
    },
    Edit {
        chat_id: String,
        message_id: String,
        sender_id: String,
        text: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        from_me: bool,
    },
    Reaction {
        chat_id: String,
        message_id: String,
        reactor_id: String,
        #[serde(default)]
        emoji: String,
        timestamp: DateTime<Utc>,
    },
    Receipt {
        chat_id: String,
        message_ids: Vec<String>,
        status: DeliveryStatus,
        timestamp: DateTime<Utc>,
    },
    MediaMetadata {
        chat_id: String,
        message_id: String,
        media: MediaDescriptor,
    },
    ChatMetadata {
        chat_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Contact {
        contact_id: String,
        #[serde(default)]
        name: Option<String>,
    },
    Notice {
        chat_id: String,
        message_id: String,
        text: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        sender_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: ContactId,
    pub sender_name: Option<String>,
    pub chat_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
    pub kind: ContentKind,
    pub text: Option<String>,
    pub quoted_message_id: Option<MessageId>,
    pub media: Option<MediaDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditEvent {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: ContactId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub from_me: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReactionEvent {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub reactor_id: ContactId,
    pub emoji: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptEvent {
    pub chat_id: ChatId,
    pub message_ids: Vec<MessageId>,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaMetadataEvent {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub media: MediaDescriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemEvent {
    ChatMetadata {
        chat_id: ChatId,
        name: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    ContactUpdated {
        contact_id: ContactId,
        name: Option<String>,
    },
    Notice {
        chat_id: ChatId,
        message_id: MessageId,
        sender_id: Option<ContactId>,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

/// Classified inbound event; each variant maps onto exactly one store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage(MessageEvent),
    Edit(EditEvent),
    Reaction(ReactionEvent),
    Receipt(ReceiptEvent),
    MediaMetadata(MediaMetadataEvent),
    System(SystemEvent),
}

impl InboundEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::Edit(_) => "edit",
            Self::Reaction(_) => "reaction",
            Self::Receipt(_) => "receipt",
            Self::MediaMetadata(_) => "media_metadata",
            Self::System(_) => "system",
        }
    }
}
