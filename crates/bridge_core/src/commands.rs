use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use shared::{
    domain::{ChatId, ContactId, ContentKind, DeliveryStatus, Direction, MessageId, DIRECT_SERVER},
    protocol::{OutboundPayload, QuotedRef, SendAck},
};
use storage::{MessageUpsert, ReactionUpsert, Storage};

use crate::{
    error::{BridgeError, BridgeResult},
    media::{MediaPipeline, PreparedMedia},
    session::SessionManager,
};

/// Sender id recorded for outbound rows when the own account id is unknown.
const SELF_SENDER: &str = "me";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTo {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<ContactId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub kind: ContentKind,
}

/// User-initiated sends and downloads. Every successful send is mirrored
/// into the store before returning, so it is readable before the remote
/// echo arrives.
pub struct CommandApi {
    storage: Storage,
    session: Arc<SessionManager>,
    media: Arc<MediaPipeline>,
}

impl CommandApi {
    pub fn new(storage: Storage, session: Arc<SessionManager>, media: Arc<MediaPipeline>) -> Self {
        Self {
            storage,
            session,
            media,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Accepts a known chat id, a direct chat id, or a bare phone number.
    pub async fn resolve_recipient(&self, recipient: &str) -> BridgeResult<ChatId> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(BridgeError::UnknownRecipient("empty recipient".to_string()));
        }

        if recipient.contains('@') {
            let chat_id = ChatId::new(recipient);
            if self.storage.chat_exists(&chat_id).await? {
                return Ok(chat_id);
            }
            if chat_id.is_group() {
                return Err(BridgeError::UnknownRecipient(format!(
                    "no known group chat {recipient}"
                )));
            }
            if chat_id.server() == Some(DIRECT_SERVER) && is_phone_number(chat_id.user_part()) {
                return Ok(chat_id);
            }
            return Err(BridgeError::UnknownRecipient(recipient.to_string()));
        }

        let digits = recipient.strip_prefix('+').unwrap_or(recipient);
        if is_phone_number(digits) {
            Ok(ChatId::direct(digits))
        } else {
            Err(BridgeError::UnknownRecipient(recipient.to_string()))
        }
    }

    pub async fn send_message(
        &self,
        recipient: &str,
        text: &str,
        reply_to: Option<ReplyTo>,
    ) -> BridgeResult<SentMessage> {
        if text.trim().is_empty() {
            return Err(BridgeError::Validation("message text is empty".to_string()));
        }
        let chat_id = self.resolve_recipient(recipient).await?;
        let quoted = self.quoted_ref(&chat_id, reply_to).await;
        let quoted_message_id = quoted.as_ref().map(|quoted| quoted.message_id.clone());

        let ack = self
            .session
            .send(&OutboundPayload::Text {
                chat_id: chat_id.clone(),
                text: text.to_string(),
                quoted,
            })
            .await?;
        info!(chat_id = %chat_id, message_id = %ack.message_id, "message sent");

        self.mirror_send(
            &chat_id,
            &ack,
            ContentKind::Text,
            Some(text.to_string()),
            quoted_message_id,
            None,
        )
        .await;
        Ok(SentMessage {
            chat_id,
            message_id: ack.message_id,
            timestamp: ack.timestamp,
            kind: ContentKind::Text,
        })
    }

    pub async fn send_file(
        &self,
        recipient: &str,
        path: &Path,
        kind: Option<ContentKind>,
        caption: Option<String>,
        reply_to: Option<ReplyTo>,
    ) -> BridgeResult<SentMessage> {
        if let Some(kind) = kind.filter(|kind| !kind.is_media()) {
            return Err(BridgeError::Validation(format!("{kind} is not a media kind")));
        }
        let chat_id = self.resolve_recipient(recipient).await?;
        let prepared = self.media.prepare_upload(path, kind).await?;
        self.send_prepared(chat_id, prepared, caption, reply_to)
            .await
    }

    /// Sends audio as a voice note; falls back to a document attachment when
    /// it cannot be encoded.
    pub async fn send_audio_message(
        &self,
        recipient: &str,
        path: &Path,
        reply_to: Option<ReplyTo>,
    ) -> BridgeResult<SentMessage> {
        let chat_id = self.resolve_recipient(recipient).await?;
        let prepared = self.media.prepare_audio(path).await?;
        self.send_prepared(chat_id, prepared, None, reply_to).await
    }

    async fn send_prepared(
        &self,
        chat_id: ChatId,
        prepared: PreparedMedia,
        caption: Option<String>,
        reply_to: Option<ReplyTo>,
    ) -> BridgeResult<SentMessage> {
        let caption = caption.filter(|caption| !caption.trim().is_empty());
        let quoted = self.quoted_ref(&chat_id, reply_to).await;
        let quoted_message_id = quoted.as_ref().map(|quoted| quoted.message_id.clone());

        let ack = self
            .session
            .send(&OutboundPayload::Media {
                chat_id: chat_id.clone(),
                kind: prepared.kind,
                media: prepared.descriptor.clone(),
                caption: caption.clone(),
                voice_note: prepared.voice_note,
                quoted,
            })
            .await?;
        info!(
            chat_id = %chat_id,
            message_id = %ack.message_id,
            kind = %prepared.kind,
            "media sent"
        );

        let kind = prepared.kind;
        self.mirror_send(&chat_id, &ack, kind, caption, quoted_message_id, Some(prepared))
            .await;
        Ok(SentMessage {
            chat_id,
            message_id: ack.message_id,
            timestamp: ack.timestamp,
            kind,
        })
    }

    /// Reacts to a message; an empty emoji removes the own reaction.
    pub async fn send_reaction(
        &self,
        chat_id: &str,
        message_id: &MessageId,
        emoji: &str,
        target_sender: Option<ContactId>,
    ) -> BridgeResult<()> {
        if message_id.as_str().trim().is_empty() {
            return Err(BridgeError::Validation("message id is empty".to_string()));
        }
        let chat_id = self.resolve_recipient(chat_id).await?;
        let target_sender = match target_sender {
            Some(sender) => Some(sender),
            None => self.stored_sender(&chat_id, message_id).await,
        };

        let ack = self
            .session
            .send(&OutboundPayload::Reaction {
                chat_id: chat_id.clone(),
                message_id: message_id.clone(),
                target_sender,
                emoji: emoji.to_string(),
            })
            .await?;

        let reaction = ReactionUpsert {
            chat_id: chat_id.clone(),
            message_id: message_id.clone(),
            reactor_id: self.own_sender(),
            emoji: emoji.to_string(),
            timestamp: ack.timestamp,
        };
        if let Err(err) = self.storage.upsert_reaction(&reaction).await {
            error!(
                chat_id = %chat_id,
                message_id = %message_id,
                error = %format!("{err:#}"),
                "reaction sent but not recorded"
            );
        }
        Ok(())
    }

    pub async fn download_media(&self, chat_id: &str, message_id: &str) -> BridgeResult<PathBuf> {
        let (chat_id, message_id) = (chat_id.trim(), message_id.trim());
        if chat_id.is_empty() || message_id.is_empty() {
            return Err(BridgeError::Validation(
                "chat id and message id are required".to_string(),
            ));
        }
        self.media
            .resolve(&ChatId::new(chat_id), &MessageId::new(message_id))
            .await
    }

    fn own_sender(&self) -> ContactId {
        self.session
            .own_id()
            .unwrap_or_else(|| ContactId::new(SELF_SENDER))
    }

    async fn quoted_ref(&self, chat_id: &ChatId, reply_to: Option<ReplyTo>) -> Option<QuotedRef> {
        let reply_to = reply_to?;
        let sender_id = match reply_to.sender_id {
            Some(sender_id) => Some(sender_id),
            None => self.stored_sender(chat_id, &reply_to.message_id).await,
        };
        Some(QuotedRef {
            message_id: reply_to.message_id,
            sender_id,
        })
    }

    /// Author of a stored message, with own messages mapped to the own id.
    async fn stored_sender(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<ContactId> {
        match self.storage.message(chat_id, message_id).await {
            Ok(Some(message)) if message.is_from_me() => self.session.own_id(),
            Ok(Some(message)) => Some(message.sender_id),
            Ok(None) => None,
            Err(err) => {
                warn!(
                    chat_id = %chat_id,
                    message_id = %message_id,
                    error = %format!("{err:#}"),
                    "could not look up quoted sender"
                );
                None
            }
        }
    }

    async fn mirror_send(
        &self,
        chat_id: &ChatId,
        ack: &SendAck,
        kind: ContentKind,
        text: Option<String>,
        quoted_message_id: Option<MessageId>,
        media: Option<PreparedMedia>,
    ) {
        let (media, local_media_path) = match media {
            Some(prepared) => (Some(prepared.descriptor), Some(prepared.local_path)),
            None => (None, None),
        };
        let upsert = MessageUpsert {
            chat_id: chat_id.clone(),
            message_id: ack.message_id.clone(),
            sender_id: self.own_sender(),
            sender_name: None,
            chat_name: None,
            timestamp: ack.timestamp,
            direction: Direction::Outbound,
            kind,
            text,
            quoted_message_id,
            delivery_status: Some(DeliveryStatus::Sent),
            media,
            local_media_path,
        };
        if let Err(err) = self.storage.upsert_message(&upsert).await {
            error!(
                chat_id = %chat_id,
                message_id = %ack.message_id,
                error = %format!("{err:#}"),
                "message sent but not recorded"
            );
        }
    }
}

fn is_phone_number(value: &str) -> bool {
    (5..=20).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
