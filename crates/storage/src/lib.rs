use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, SqliteConnection,
};
use std::{
    future::Future,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use shared::{
    domain::{ChatId, ChatKind, ContactId, ContentKind, DeliveryStatus, Direction, MessageId},
    protocol::MediaDescriptor,
};

mod history;

pub use history::{ChatQuery, ChatSort, MessageQuery};

const WRITE_ATTEMPTS: u32 = 5;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(25);
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Persistent bridge state. All mutations are serialized through one writer.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    writer: Arc<Mutex<()>>,
}

/// A write kept colliding with another connection's lock after every retry.
#[derive(Debug, Clone, Error)]
#[error("store write '{operation}' still conflicted after {attempts} attempts")]
pub struct StoreConflict {
    pub operation: &'static str,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        self != Self::Unchanged
    }
}

#[derive(Debug, Clone)]
pub struct MessageUpsert {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: ContactId,
    pub sender_name: Option<String>,
    pub chat_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub kind: ContentKind,
    pub text: Option<String>,
    pub quoted_message_id: Option<MessageId>,
    pub delivery_status: Option<DeliveryStatus>,
    pub media: Option<MediaDescriptor>,
    pub local_media_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EditUpsert {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender_id: ContactId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub struct ReactionUpsert {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub reactor_id: ContactId,
    /// Empty means the reaction was removed.
    pub emoji: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMedia {
    pub descriptor: MediaDescriptor,
    pub local_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub chat_id: ChatId,
    pub chat_name: Option<String>,
    pub message_id: MessageId,
    pub sender_id: ContactId,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub kind: ContentKind,
    pub text: Option<String>,
    pub quoted_message_id: Option<MessageId>,
    pub edited: bool,
    pub delivery_status: DeliveryStatus,
    pub media: Option<StoredMedia>,
}

impl StoredMessage {
    pub fn is_from_me(&self) -> bool {
        self.direction.is_from_me()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReaction {
    pub reactor_id: ContactId,
    pub emoji: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredContact {
    pub contact_id: ContactId,
    pub name: Option<String>,
}

impl StoredContact {
    pub fn phone_number(&self) -> &str {
        self.contact_id.phone_number()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub name: Option<String>,
    pub kind: ChatKind,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_message: Option<LastMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastMessage {
    pub sender_id: ContactId,
    pub text: Option<String>,
    pub kind: ContentKind,
    pub is_from_me: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageContext {
    pub message: StoredMessage,
    pub before: Vec<StoredMessage>,
    pub after: Vec<StoredMessage>,
}

/// Column image of a `messages` row, used to merge replays and edits.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MessageRow {
    sender_id: String,
    timestamp_ms: i64,
    direction: String,
    kind: String,
    text: Option<String>,
    quoted_message_id: Option<String>,
    version_ms: i64,
    edited: bool,
    delivery_rank: i64,
}

impl MessageRow {
    fn from_upsert(upsert: &MessageUpsert) -> Self {
        let timestamp_ms = to_millis(upsert.timestamp);
        Self {
            sender_id: upsert.sender_id.to_string(),
            timestamp_ms,
            direction: upsert.direction.to_string(),
            kind: upsert.kind.to_string(),
            text: upsert.text.clone(),
            quoted_message_id: upsert.quoted_message_id.as_ref().map(ToString::to_string),
            version_ms: timestamp_ms,
            edited: false,
            delivery_rank: upsert.delivery_status.map(DeliveryStatus::rank).unwrap_or(0),
        }
    }
}

/// Merges a replayed or late original message into what is already stored.
///
/// Content follows the higher version, ties going to the arrival. The
/// original timestamp is the earliest one seen, and fields an edit cannot
/// carry (quote, media kind) are filled in when the stored row lacks them.
fn merge_message(stored: &MessageRow, incoming: &MessageRow) -> MessageRow {
    let incoming_wins = incoming.version_ms >= stored.version_ms;
    let (sender_id, text, kind) = if incoming_wins && !stored.edited {
        (
            incoming.sender_id.clone(),
            incoming.text.clone(),
            incoming.kind.clone(),
        )
    } else {
        let kind = if stored.kind == ContentKind::Text.as_str() && incoming.kind != stored.kind {
            incoming.kind.clone()
        } else {
            stored.kind.clone()
        };
        (stored.sender_id.clone(), stored.text.clone(), kind)
    };

    MessageRow {
        sender_id,
        timestamp_ms: stored.timestamp_ms.min(incoming.timestamp_ms),
        direction: stored.direction.clone(),
        kind,
        text,
        quoted_message_id: stored
            .quoted_message_id
            .clone()
            .or_else(|| incoming.quoted_message_id.clone()),
        version_ms: stored.version_ms.max(incoming.version_ms),
        edited: stored.edited,
        delivery_rank: stored.delivery_rank.max(incoming.delivery_rank),
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = is_memory_url(database_url);
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to an in-memory URL opens its own empty database.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Runs one write transaction under the writer lock, retrying lock conflicts.
    async fn write<T, F, Fut>(&self, operation: &'static str, mut attempt_write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _writer = self.writer.lock().await;
        let mut attempt = 1;
        loop {
            match attempt_write().await {
                Err(err) if is_lock_conflict(&err) => {
                    if attempt >= WRITE_ATTEMPTS {
                        return Err(err.context(StoreConflict {
                            operation,
                            attempts: attempt,
                        }));
                    }
                    warn!(operation, attempt, error = %err, "store write conflicted; retrying");
                    tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn upsert_message(&self, upsert: &MessageUpsert) -> Result<UpsertOutcome> {
        self.write("upsert_message", move || self.upsert_message_once(upsert))
            .await
    }

    async fn upsert_message_once(&self, upsert: &MessageUpsert) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        upsert_chat_row(
            &mut tx,
            &upsert.chat_id,
            upsert.chat_name.as_deref(),
            Some(to_millis(upsert.timestamp)),
        )
        .await?;
        if !upsert.direction.is_from_me() || upsert.sender_name.is_some() {
            upsert_contact_row(
                &mut tx,
                &upsert.sender_id,
                upsert.sender_name.as_deref(),
                to_millis(upsert.timestamp),
            )
            .await?;
        }

        let incoming = MessageRow::from_upsert(upsert);
        let stored = load_message_row(&mut tx, &upsert.chat_id, &upsert.message_id).await?;
        let mut outcome = match stored {
            None => {
                insert_message_row(&mut tx, &upsert.chat_id, &upsert.message_id, &incoming).await?;
                UpsertOutcome::Inserted
            }
            Some(stored) => {
                let merged = merge_message(&stored, &incoming);
                if merged == stored {
                    UpsertOutcome::Unchanged
                } else {
                    update_message_row(&mut tx, &upsert.chat_id, &upsert.message_id, &merged)
                        .await?;
                    UpsertOutcome::Updated
                }
            }
        };

        if let Some(media) = &upsert.media {
            let media_outcome = upsert_media_row(
                &mut tx,
                &upsert.chat_id,
                &upsert.message_id,
                media,
                upsert.local_media_path.as_deref(),
            )
            .await?;
            if outcome == UpsertOutcome::Unchanged && media_outcome.changed() {
                outcome = UpsertOutcome::Updated;
            }
        }

        tx.commit().await?;
        debug!(
            chat_id = %upsert.chat_id,
            message_id = %upsert.message_id,
            ?outcome,
            "message upserted"
        );
        Ok(outcome)
    }

    /// Applies an edit. An edit for an unseen message stores a placeholder
    /// that the original later completes.
    pub async fn apply_edit(&self, edit: &EditUpsert) -> Result<UpsertOutcome> {
        self.write("apply_edit", move || self.apply_edit_once(edit))
            .await
    }

    async fn apply_edit_once(&self, edit: &EditUpsert) -> Result<UpsertOutcome> {
        let edit_ms = to_millis(edit.timestamp);
        let mut tx = self.pool.begin().await?;
        upsert_chat_row(&mut tx, &edit.chat_id, None, Some(edit_ms)).await?;

        let stored = load_message_row(&mut tx, &edit.chat_id, &edit.message_id).await?;
        let outcome = match stored {
            None => {
                let placeholder = MessageRow {
                    sender_id: edit.sender_id.to_string(),
                    timestamp_ms: edit_ms,
                    direction: edit.direction.to_string(),
                    kind: ContentKind::Text.to_string(),
                    text: Some(edit.text.clone()),
                    quoted_message_id: None,
                    version_ms: edit_ms,
                    edited: true,
                    delivery_rank: 0,
                };
                insert_message_row(&mut tx, &edit.chat_id, &edit.message_id, &placeholder)
                    .await?;
                UpsertOutcome::Inserted
            }
            Some(stored) if edit_ms >= stored.version_ms => {
                let edited = MessageRow {
                    text: Some(edit.text.clone()),
                    version_ms: edit_ms,
                    edited: true,
                    ..stored.clone()
                };
                if edited == stored {
                    UpsertOutcome::Unchanged
                } else {
                    update_message_row(&mut tx, &edit.chat_id, &edit.message_id, &edited).await?;
                    UpsertOutcome::Updated
                }
            }
            Some(_) => UpsertOutcome::Unchanged,
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Records the latest reaction per reactor. Removals are kept as
    /// tombstones so an older add replayed later cannot resurrect them.
    pub async fn upsert_reaction(&self, reaction: &ReactionUpsert) -> Result<UpsertOutcome> {
        self.write("upsert_reaction", move || {
            self.upsert_reaction_once(reaction)
        })
        .await
    }

    async fn upsert_reaction_once(&self, reaction: &ReactionUpsert) -> Result<UpsertOutcome> {
        let timestamp_ms = to_millis(reaction.timestamp);
        let mut tx = self.pool.begin().await?;
        let stored = sqlx::query(
            "SELECT emoji, timestamp_ms FROM reactions
             WHERE chat_id = ? AND message_id = ? AND reactor_id = ?",
        )
        .bind(reaction.chat_id.as_str())
        .bind(reaction.message_id.as_str())
        .bind(reaction.reactor_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)));

        let outcome = match stored {
            Some((emoji, stored_ms))
                if timestamp_ms < stored_ms
                    || (emoji == reaction.emoji && stored_ms == timestamp_ms) =>
            {
                UpsertOutcome::Unchanged
            }
            stored => {
                sqlx::query(
                    "INSERT INTO reactions (chat_id, message_id, reactor_id, emoji, timestamp_ms)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(chat_id, message_id, reactor_id) DO UPDATE SET
                        emoji = excluded.emoji,
                        timestamp_ms = excluded.timestamp_ms",
                )
                .bind(reaction.chat_id.as_str())
                .bind(reaction.message_id.as_str())
                .bind(reaction.reactor_id.as_str())
                .bind(&reaction.emoji)
                .bind(timestamp_ms)
                .execute(&mut *tx)
                .await?;
                if stored.is_some() {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Inserted
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    /// Moves delivery status forward for each listed message; never backward.
    /// Returns how many stored messages changed.
    pub async fn apply_receipt(
        &self,
        chat_id: &ChatId,
        message_ids: &[MessageId],
        status: DeliveryStatus,
    ) -> Result<u64> {
        self.write("apply_receipt", move || {
            self.apply_receipt_once(chat_id, message_ids, status)
        })
        .await
    }

    async fn apply_receipt_once(
        &self,
        chat_id: &ChatId,
        message_ids: &[MessageId],
        status: DeliveryStatus,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;
        for message_id in message_ids {
            changed += sqlx::query(
                "UPDATE messages SET delivery_rank = ?
                 WHERE chat_id = ? AND message_id = ? AND delivery_rank < ?",
            )
            .bind(status.rank())
            .bind(chat_id.as_str())
            .bind(message_id.as_str())
            .bind(status.rank())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(changed)
    }

    pub async fn upsert_media_ref(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        media: &MediaDescriptor,
    ) -> Result<UpsertOutcome> {
        self.write("upsert_media_ref", move || async move {
            let mut tx = self.pool.begin().await?;
            let outcome = upsert_media_row(&mut tx, chat_id, message_id, media, None).await?;
            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }

    /// Records where a media blob was materialized. Returns false when no
    /// descriptor is stored for the message.
    pub async fn set_media_local_path(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        local_path: &Path,
    ) -> Result<bool> {
        let local_path = local_path.to_string_lossy().to_string();
        let local_path = local_path.as_str();
        self.write("set_media_local_path", move || async move {
            let result = sqlx::query(
                "UPDATE media_refs SET local_path = ? WHERE chat_id = ? AND message_id = ?",
            )
            .bind(local_path)
            .bind(chat_id.as_str())
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    pub async fn upsert_chat(
        &self,
        chat_id: &ChatId,
        name: Option<&str>,
        activity: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome> {
        self.write("upsert_chat", move || async move {
            let mut tx = self.pool.begin().await?;
            let outcome = upsert_chat_row(&mut tx, chat_id, name, activity.map(to_millis)).await?;
            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }

    pub async fn upsert_contact(
        &self,
        contact_id: &ContactId,
        name: Option<&str>,
    ) -> Result<UpsertOutcome> {
        self.write("upsert_contact", move || async move {
            let mut tx = self.pool.begin().await?;
            let outcome =
                upsert_contact_row(&mut tx, contact_id, name, to_millis(Utc::now())).await?;
            tx.commit().await?;
            Ok(outcome)
        })
        .await
    }
}

async fn load_message_row(
    conn: &mut SqliteConnection,
    chat_id: &ChatId,
    message_id: &MessageId,
) -> Result<Option<MessageRow>> {
    let row = sqlx::query(
        "SELECT sender_id, timestamp_ms, direction, kind, text, quoted_message_id,
                version_ms, edited, delivery_rank
         FROM messages WHERE chat_id = ? AND message_id = ?",
    )
    .bind(chat_id.as_str())
    .bind(message_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| MessageRow {
        sender_id: r.get(0),
        timestamp_ms: r.get(1),
        direction: r.get(2),
        kind: r.get(3),
        text: r.get(4),
        quoted_message_id: r.get(5),
        version_ms: r.get(6),
        edited: r.get::<i64, _>(7) != 0,
        delivery_rank: r.get(8),
    }))
}

async fn insert_message_row(
    conn: &mut SqliteConnection,
    chat_id: &ChatId,
    message_id: &MessageId,
    row: &MessageRow,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (chat_id, message_id, sender_id, timestamp_ms, direction, kind,
                               text, quoted_message_id, version_ms, edited, delivery_rank)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(chat_id.as_str())
    .bind(message_id.as_str())
    .bind(&row.sender_id)
    .bind(row.timestamp_ms)
    .bind(&row.direction)
    .bind(&row.kind)
    .bind(&row.text)
    .bind(&row.quoted_message_id)
    .bind(row.version_ms)
    .bind(i64::from(row.edited))
    .bind(row.delivery_rank)
    .execute(&mut *conn)
    .await
    .context("failed to insert message")?;
    Ok(())
}

async fn update_message_row(
    conn: &mut SqliteConnection,
    chat_id: &ChatId,
    message_id: &MessageId,
    row: &MessageRow,
) -> Result<()> {
    sqlx::query(
        "UPDATE messages SET sender_id = ?, timestamp_ms = ?, kind = ?, text = ?,
                quoted_message_id = ?, version_ms = ?, edited = ?, delivery_rank = ?
         WHERE chat_id = ? AND message_id = ?",
    )
    .bind(&row.sender_id)
    .bind(row.timestamp_ms)
    .bind(&row.kind)
    .bind(&row.text)
    .bind(&row.quoted_message_id)
    .bind(row.version_ms)
    .bind(i64::from(row.edited))
    .bind(row.delivery_rank)
    .bind(chat_id.as_str())
    .bind(message_id.as_str())
    .execute(&mut *conn)
    .await
    .context("failed to update message")?;
    Ok(())
}

async fn upsert_chat_row(
    conn: &mut SqliteConnection,
    chat_id: &ChatId,
    name: Option<&str>,
    activity_ms: Option<i64>,
) -> Result<UpsertOutcome> {
    let name = name.map(str::trim).filter(|name| !name.is_empty());
    let stored = sqlx::query("SELECT name, last_activity_ms FROM chats WHERE chat_id = ?")
        .bind(chat_id.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| {
            (
                row.get::<Option<String>, _>(0),
                row.get::<Option<i64>, _>(1),
            )
        });

    let outcome = match stored {
        None => {
            sqlx::query(
                "INSERT INTO chats (chat_id, name, kind, last_activity_ms) VALUES (?, ?, ?, ?)",
            )
            .bind(chat_id.as_str())
            .bind(name)
            .bind(chat_id.kind().as_str())
            .bind(activity_ms)
            .execute(&mut *conn)
            .await?;
            UpsertOutcome::Inserted
        }
        Some((stored_name, stored_activity)) => {
            let next_name = name.map(str::to_string).or(stored_name.clone());
            let next_activity = stored_activity.max(activity_ms);
            if next_name == stored_name && next_activity == stored_activity {
                UpsertOutcome::Unchanged
            } else {
                sqlx::query("UPDATE chats SET name = ?, last_activity_ms = ? WHERE chat_id = ?")
                    .bind(&next_name)
                    .bind(next_activity)
                    .bind(chat_id.as_str())
                    .execute(&mut *conn)
                    .await?;
                UpsertOutcome::Updated
            }
        }
    };

    // Direct chats double as the contact directory.
    if chat_id.kind() == ChatKind::Direct {
        let contact_id = ContactId::new(chat_id.as_str());
        upsert_contact_row(conn, &contact_id, name, activity_ms.unwrap_or_default()).await?;
    }
    Ok(outcome)
}

async fn upsert_contact_row(
    conn: &mut SqliteConnection,
    contact_id: &ContactId,
    name: Option<&str>,
    updated_ms: i64,
) -> Result<UpsertOutcome> {
    let name = name.map(str::trim).filter(|name| !name.is_empty());
    let stored = sqlx::query("SELECT name FROM contacts WHERE contact_id = ?")
        .bind(contact_id.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| row.get::<Option<String>, _>(0));

    match stored {
        None => {
            sqlx::query("INSERT INTO contacts (contact_id, name, updated_ms) VALUES (?, ?, ?)")
                .bind(contact_id.as_str())
                .bind(name)
                .bind(updated_ms)
                .execute(&mut *conn)
                .await?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(stored_name) => match name {
            Some(name) if stored_name.as_deref() != Some(name) => {
                sqlx::query("UPDATE contacts SET name = ?, updated_ms = ? WHERE contact_id = ?")
                    .bind(name)
                    .bind(updated_ms)
                    .bind(contact_id.as_str())
                    .execute(&mut *conn)
                    .await?;
                Ok(UpsertOutcome::Updated)
            }
            _ => Ok(UpsertOutcome::Unchanged),
        },
    }
}

async fn upsert_media_row(
    conn: &mut SqliteConnection,
    chat_id: &ChatId,
    message_id: &MessageId,
    media: &MediaDescriptor,
    local_path: Option<&Path>,
) -> Result<UpsertOutcome> {
    let stored = load_media(conn, chat_id, message_id).await?;
    let local_path = stored
        .as_ref()
        .and_then(|stored| stored.local_path.clone())
        .or_else(|| local_path.map(Path::to_path_buf));

    let outcome = match &stored {
        None => UpsertOutcome::Inserted,
        Some(stored) if stored.descriptor == *media && stored.local_path == local_path => {
            return Ok(UpsertOutcome::Unchanged);
        }
        Some(_) => UpsertOutcome::Updated,
    };

    sqlx::query(
        "INSERT INTO media_refs (chat_id, message_id, url, direct_path, media_key_b64,
                                 file_sha256_b64, file_enc_sha256_b64, mime_type, file_name,
                                 file_length, local_path)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(chat_id, message_id) DO UPDATE SET
            url = excluded.url,
            direct_path = COALESCE(excluded.direct_path, media_refs.direct_path),
            media_key_b64 = excluded.media_key_b64,
            file_sha256_b64 = COALESCE(excluded.file_sha256_b64, media_refs.file_sha256_b64),
            file_enc_sha256_b64 = COALESCE(excluded.file_enc_sha256_b64, media_refs.file_enc_sha256_b64),
            mime_type = COALESCE(excluded.mime_type, media_refs.mime_type),
            file_name = COALESCE(excluded.file_name, media_refs.file_name),
            file_length = COALESCE(excluded.file_length, media_refs.file_length),
            local_path = COALESCE(media_refs.local_path, excluded.local_path)",
    )
    .bind(chat_id.as_str())
    .bind(message_id.as_str())
    .bind(&media.url)
    .bind(&media.direct_path)
    .bind(&media.media_key_b64)
    .bind(&media.file_sha256_b64)
    .bind(&media.file_enc_sha256_b64)
    .bind(&media.mime_type)
    .bind(&media.file_name)
    .bind(media.file_length.map(|len| len as i64))
    .bind(local_path.as_ref().map(|path| path.to_string_lossy().to_string()))
    .execute(&mut *conn)
    .await
    .context("failed to upsert media reference")?;
    Ok(outcome)
}

async fn load_media(
    conn: &mut SqliteConnection,
    chat_id: &ChatId,
    message_id: &MessageId,
) -> Result<Option<StoredMedia>> {
    let row = sqlx::query(
        "SELECT url, direct_path, media_key_b64, file_sha256_b64, file_enc_sha256_b64,
                mime_type, file_name, file_length, local_path
         FROM media_refs WHERE chat_id = ? AND message_id = ?",
    )
    .bind(chat_id.as_str())
    .bind(message_id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|row| media_from_row(&row, 0)).transpose()
}

/// Decodes the nine media columns starting at `offset`.
fn media_from_row(row: &SqliteRow, offset: usize) -> Result<StoredMedia> {
    let file_length: Option<i64> = row.try_get(offset + 7)?;
    let local_path: Option<String> = row.try_get(offset + 8)?;
    Ok(StoredMedia {
        descriptor: MediaDescriptor {
            url: row.try_get(offset)?,
            direct_path: row.try_get(offset + 1)?,
            media_key_b64: row.try_get(offset + 2)?,
            file_sha256_b64: row.try_get(offset + 3)?,
            file_enc_sha256_b64: row.try_get(offset + 4)?,
            mime_type: row.try_get(offset + 5)?,
            file_name: row.try_get(offset + 6)?,
            file_length: file_length.map(|len| len.max(0) as u64),
        },
        local_path: local_path.map(PathBuf::from),
    })
}

fn is_lock_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let Some(sqlx::Error::Database(db_err)) = cause.downcast_ref::<sqlx::Error>() else {
            return false;
        };
        db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
    })
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
