use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use shared::{
    domain::{ChatId, ContactId, ContentKind, Direction, MessageId},
    protocol::{
        EditEvent, InboundEvent, MediaMetadataEvent, MessageEvent, ReactionEvent, ReceiptEvent,
        SystemEvent, WireEvent,
    },
};
use storage::{EditUpsert, MessageUpsert, ReactionUpsert, Storage, UpsertOutcome};

const KNOWN_EVENT_TYPES: &[&str] = &[
    "message",
    "edit",
    "reaction",
    "receipt",
    "media_metadata",
    "chat_metadata",
    "contact",
    "notice",
];

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("event has no type tag")]
    MissingType,
    #[error("unrecognized event type '{0}'")]
    Unrecognized(String),
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("event is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("message carries neither text nor media")]
    EmptyMessage,
}

/// Turns one raw protocol event into the single store mutation it implies.
pub fn classify(raw: &Value) -> Result<InboundEvent, ClassifyError> {
    let tag = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ClassifyError::MissingType)?;
    if !KNOWN_EVENT_TYPES.contains(&tag) {
        return Err(ClassifyError::Unrecognized(tag.to_string()));
    }

    let event = match serde_json::from_value::<WireEvent>(raw.clone())? {
        WireEvent::Message {
            chat_id,
            message_id,
            sender_id,
            sender_name,
            chat_name,
            timestamp,
            from_me,
            kind,
            text,
            quoted_message_id,
            media,
        } => {
            let text = text.filter(|text| !text.is_empty());
            if text.is_none() && media.is_none() {
                return Err(ClassifyError::EmptyMessage);
            }
            let kind = kind.unwrap_or_else(|| match &media {
                Some(media) => media
                    .mime_type
                    .as_deref()
                    .map(ContentKind::from_mime)
                    .unwrap_or(ContentKind::Document),
                None => ContentKind::Text,
            });
            InboundEvent::NewMessage(MessageEvent {
                chat_id: chat_id_field(chat_id)?,
                message_id: message_id_field(message_id)?,
                sender_id: contact_field(sender_id, "sender_id")?,
                sender_name: non_blank(sender_name),
                chat_name: non_blank(chat_name),
                timestamp,
                from_me,
                kind,
                text,
                quoted_message_id: non_blank(quoted_message_id).map(MessageId::new),
                media,
            })
        }
        WireEvent::Edit {
            chat_id,
            message_id,
            sender_id,
            text,
            timestamp,
            from_me,
        } => InboundEvent::Edit(EditEvent {
            chat_id: chat_id_field(chat_id)?,
            message_id: message_id_field(message_id)?,
            sender_id: contact_field(sender_id, "sender_id")?,
            text,
            timestamp,
            from_me,
        }),
        WireEvent::Reaction {
            chat_id,
            message_id,
            reactor_id,
            emoji,
            timestamp,
        } => InboundEvent::Reaction(ReactionEvent {
            chat_id: chat_id_field(chat_id)?,
            message_id: message_id_field(message_id)?,
            reactor_id: contact_field(reactor_id, "reactor_id")?,
            emoji,
            timestamp,
        }),
        WireEvent::Receipt {
            chat_id,
            message_ids,
            status,
            timestamp,
        } => {
            let message_ids: Vec<MessageId> = message_ids
                .into_iter()
                .filter(|id| !id.trim().is_empty())
                .map(MessageId::new)
                .collect();
            if message_ids.is_empty() {
                return Err(ClassifyError::MissingField("message_ids"));
            }
            InboundEvent::Receipt(ReceiptEvent {
                chat_id: chat_id_field(chat_id)?,
                message_ids,
                status,
                timestamp,
            })
        }
        WireEvent::MediaMetadata {
            chat_id,
            message_id,
            media,
        } => {
            if media.url.is_empty() || media.media_key_b64.is_empty() {
                return Err(ClassifyError::MissingField("media.url"));
            }
            InboundEvent::MediaMetadata(MediaMetadataEvent {
                chat_id: chat_id_field(chat_id)?,
                message_id: message_id_field(message_id)?,
                media,
            })
        }
        WireEvent::ChatMetadata {
            chat_id,
            name,
            timestamp,
        } => InboundEvent::System(SystemEvent::ChatMetadata {
            chat_id: chat_id_field(chat_id)?,
            name: non_blank(name),
            timestamp,
        }),
        WireEvent::Contact { contact_id, name } => {
            InboundEvent::System(SystemEvent::ContactUpdated {
                contact_id: contact_field(contact_id, "contact_id")?,
                name: non_blank(name),
            })
        }
        WireEvent::Notice {
            chat_id,
            message_id,
            text,
            timestamp,
            sender_id,
        } => InboundEvent::System(SystemEvent::Notice {
            chat_id: chat_id_field(chat_id)?,
            message_id: message_id_field(message_id)?,
            sender_id: non_blank(sender_id).map(ContactId::new),
            text,
            timestamp,
        }),
    };
    Ok(event)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(value: String, field: &'static str) -> Result<String, ClassifyError> {
    let value = value.trim();
    if value.is_empty() {
        Err(ClassifyError::MissingField(field))
    } else {
        Ok(value.to_string())
    }
}

fn chat_id_field(value: String) -> Result<ChatId, ClassifyError> {
    required(value, "chat_id").map(ChatId::new)
}

fn message_id_field(value: String) -> Result<MessageId, ClassifyError> {
    required(value, "message_id").map(MessageId::new)
}

fn contact_field(value: String, field: &'static str) -> Result<ContactId, ClassifyError> {
    required(value, field).map(ContactId::new)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied(UpsertOutcome),
    Dropped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub applied: u64,
    pub unchanged: u64,
    pub dropped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct IngestCounters {
    applied: AtomicU64,
    unchanged: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Drains the session's event queue into the store, one event at a time in
/// arrival order.
pub struct IngestionPipeline {
    storage: Storage,
    counters: IngestCounters,
}

impl IngestionPipeline {
    pub fn new(storage: Storage) -> Arc<Self> {
        Arc::new(Self {
            storage,
            counters: IngestCounters::default(),
        })
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            applied: self.counters.applied.load(Ordering::Relaxed),
            unchanged: self.counters.unchanged.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Classifies and applies one raw event. Never fails: bad events are
    /// counted and logged.
    pub async fn ingest(&self, raw: &Value) -> IngestOutcome {
        let event = match classify(raw) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping protocol event");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return IngestOutcome::Dropped;
            }
        };

        match self.apply(&event).await {
            Ok(UpsertOutcome::Unchanged) => {
                debug!(kind = event.kind_name(), "event already applied");
                self.counters.unchanged.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Applied(UpsertOutcome::Unchanged)
            }
            Ok(outcome) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Applied(outcome)
            }
            Err(err) => {
                error!(kind = event.kind_name(), error = %format!("{err:#}"), "failed to apply event");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Failed
            }
        }
    }

    pub async fn apply(&self, event: &InboundEvent) -> Result<UpsertOutcome> {
        match event {
            InboundEvent::NewMessage(message) => {
                self.storage
                    .upsert_message(&MessageUpsert {
                        chat_id: message.chat_id.clone(),
                        message_id: message.message_id.clone(),
                        sender_id: message.sender_id.clone(),
                        sender_name: message.sender_name.clone(),
                        chat_name: message.chat_name.clone(),
                        timestamp: message.timestamp,
                        direction: Direction::from_me(message.from_me),
                        kind: message.kind,
                        text: message.text.clone(),
                        quoted_message_id: message.quoted_message_id.clone(),
                        delivery_status: None,
                        media: message.media.clone(),
                        local_media_path: None,
                    })
                    .await
            }
            InboundEvent::Edit(edit) => {
                self.storage
                    .apply_edit(&EditUpsert {
                        chat_id: edit.chat_id.clone(),
                        message_id: edit.message_id.clone(),
                        sender_id: edit.sender_id.clone(),
                        text: edit.text.clone(),
                        timestamp: edit.timestamp,
                        direction: Direction::from_me(edit.from_me),
                    })
                    .await
            }
            InboundEvent::Reaction(reaction) => {
                self.storage
                    .upsert_reaction(&ReactionUpsert {
                        chat_id: reaction.chat_id.clone(),
                        message_id: reaction.message_id.clone(),
                        reactor_id: reaction.reactor_id.clone(),
                        emoji: reaction.emoji.clone(),
                        timestamp: reaction.timestamp,
                    })
                    .await
            }
            InboundEvent::Receipt(receipt) => {
                let changed = self
                    .storage
                    .apply_receipt(&receipt.chat_id, &receipt.message_ids, receipt.status)
                    .await?;
                Ok(if changed > 0 {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                })
            }
            InboundEvent::MediaMetadata(metadata) => {
                self.storage
                    .upsert_media_ref(&metadata.chat_id, &metadata.message_id, &metadata.media)
                    .await
            }
            InboundEvent::System(SystemEvent::ChatMetadata {
                chat_id,
                name,
                timestamp,
            }) => {
                self.storage
                    .upsert_chat(chat_id, name.as_deref(), *timestamp)
                    .await
            }
            InboundEvent::System(SystemEvent::ContactUpdated { contact_id, name }) => {
                self.storage
                    .upsert_contact(contact_id, name.as_deref())
                    .await
            }
            InboundEvent::System(SystemEvent::Notice {
                chat_id,
                message_id,
                sender_id,
                text,
                timestamp,
            }) => {
                let sender_id = sender_id
                    .clone()
                    .unwrap_or_else(|| ContactId::new(chat_id.as_str()));
                self.storage
                    .upsert_message(&MessageUpsert {
                        chat_id: chat_id.clone(),
                        message_id: message_id.clone(),
                        sender_id,
                        sender_name: None,
                        chat_name: None,
                        timestamp: *timestamp,
                        direction: Direction::Inbound,
                        kind: ContentKind::System,
                        text: Some(text.clone()),
                        quoted_message_id: None,
                        delivery_status: None,
                        media: None,
                        local_media_path: None,
                    })
                    .await
            }
        }
    }

    /// Consumes events until the queue closes or shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<Value>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("ingestion started");
        loop {
            let raw = tokio::select! {
                _ = shutdown.changed() => break,
                raw = events.recv() => raw,
            };
            let Some(raw) = raw else {
                break;
            };
            self.ingest(&raw).await;
        }
        let snapshot = self.snapshot();
        info!(
            applied = snapshot.applied,
            unchanged = snapshot.unchanged,
            dropped = snapshot.dropped,
            failed = snapshot.failed,
            "ingestion stopped"
        );
    }

    pub fn spawn(
        self: &Arc<Self>,
        events: mpsc::Receiver<Value>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(events, shutdown))
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
