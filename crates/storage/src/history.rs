use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use shared::domain::{user_part, ChatId, ContactId, DeliveryStatus, Direction, MessageId};

use crate::{
    from_millis, load_media, media_from_row, to_millis, ChatSummary, LastMessage,
    MessageContext, Storage, StoredContact, StoredMedia, StoredMessage, StoredReaction,
};

const MESSAGE_SELECT: &str = "SELECT m.chat_id, c.name, m.message_id, m.sender_id, m.timestamp_ms,
        m.direction, m.kind, m.text, m.quoted_message_id, m.edited, m.delivery_rank,
        r.url, r.direct_path, r.media_key_b64, r.file_sha256_b64, r.file_enc_sha256_b64,
        r.mime_type, r.file_name, r.file_length, r.local_path
    FROM messages m
    JOIN chats c ON c.chat_id = m.chat_id
    LEFT JOIN media_refs r ON r.chat_id = m.chat_id AND r.message_id = m.message_id";

const MEDIA_OFFSET: usize = 11;

const CHAT_SELECT: &str = "SELECT c.chat_id, c.name, c.kind, c.last_activity_ms,
        lm.sender_id, lm.text, lm.kind, lm.direction
    FROM chats c
    LEFT JOIN messages lm ON lm.chat_id = c.chat_id AND lm.message_id = (
        SELECT m2.message_id FROM messages m2
        WHERE m2.chat_id = c.chat_id
        ORDER BY m2.timestamp_ms DESC, m2.rowid DESC
        LIMIT 1
    )";

/// Filters for message history; all set filters must match.
#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// A full contact id or a bare phone number.
    pub sender: Option<String>,
    pub chat_id: Option<ChatId>,
    /// Case-insensitive substring of the message text.
    pub text: Option<String>,
    pub limit: u32,
    pub page: u32,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            after: None,
            before: None,
            sender: None,
            chat_id: None,
            text: None,
            limit: 20,
            page: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChatSort {
    #[default]
    LastActive,
    Name,
}

#[derive(Debug, Clone)]
pub struct ChatQuery {
    /// Matched against chat name and chat id.
    pub query: Option<String>,
    pub limit: u32,
    pub page: u32,
    pub include_last_message: bool,
    pub sort: ChatSort,
}

impl Default for ChatQuery {
    fn default() -> Self {
        Self {
            query: None,
            limit: 20,
            page: 0,
            include_last_message: true,
            sort: ChatSort::LastActive,
        }
    }
}

impl Storage {
    pub async fn message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "{MESSAGE_SELECT} WHERE m.chat_id = ? AND m.message_id = ?"
        ))
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| message_from_row(&row)).transpose()
    }

    /// Looks a message up by id alone, for callers that only hold the message id.
    pub async fn message_by_id(&self, message_id: &MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "{MESSAGE_SELECT} WHERE m.message_id = ? ORDER BY m.timestamp_ms DESC LIMIT 1"
        ))
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| message_from_row(&row)).transpose()
    }

    pub async fn media_ref(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<Option<StoredMedia>> {
        let mut conn = self.pool.acquire().await?;
        load_media(&mut conn, chat_id, message_id).await
    }

    /// Newest first.
    pub async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>> {
        let mut builder = QueryBuilder::<Sqlite>::new(MESSAGE_SELECT);
        builder.push(" WHERE 1 = 1");
        if let Some(after) = query.after {
            builder.push(" AND m.timestamp_ms > ").push_bind(to_millis(after));
        }
        if let Some(before) = query.before {
            builder.push(" AND m.timestamp_ms < ").push_bind(to_millis(before));
        }
        if let Some(sender) = query.sender.as_deref() {
            builder
                .push(" AND (m.sender_id = ")
                .push_bind(sender.to_string())
                .push(" OR m.sender_id LIKE ")
                .push_bind(prefix_pattern(&format!("{}@", user_part(sender))))
                .push(" ESCAPE '\\')");
        }
        if let Some(chat_id) = &query.chat_id {
            builder.push(" AND m.chat_id = ").push_bind(chat_id.to_string());
        }
        if let Some(text) = query.text.as_deref() {
            builder
                .push(" AND LOWER(m.text) LIKE ")
                .push_bind(contains_pattern(&text.to_lowercase()))
                .push(" ESCAPE '\\'");
        }
        builder
            .push(" ORDER BY m.timestamp_ms DESC, m.rowid DESC LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.page) * i64::from(query.limit));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(message_from_row).collect()
    }

    /// The message plus up to `before` earlier and `after` later messages of
    /// the same chat, all in chronological order.
    pub async fn message_context(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        before: u32,
        after: u32,
    ) -> Result<Option<MessageContext>> {
        let Some(message) = self.message(chat_id, message_id).await? else {
            return Ok(None);
        };
        let anchor_ms = to_millis(message.timestamp);

        let rows = sqlx::query(&format!(
            "{MESSAGE_SELECT}
             WHERE m.chat_id = ? AND m.message_id <> ? AND m.timestamp_ms <= ?
             ORDER BY m.timestamp_ms DESC, m.rowid DESC LIMIT ?"
        ))
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .bind(anchor_ms)
        .bind(i64::from(before))
        .fetch_all(&self.pool)
        .await?;
        let mut earlier = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        earlier.reverse();

        let rows = sqlx::query(&format!(
            "{MESSAGE_SELECT}
             WHERE m.chat_id = ? AND m.message_id <> ? AND m.timestamp_ms > ?
             ORDER BY m.timestamp_ms ASC, m.rowid ASC LIMIT ?"
        ))
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .bind(anchor_ms)
        .bind(i64::from(after))
        .fetch_all(&self.pool)
        .await?;
        let later = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(MessageContext {
            message,
            before: earlier,
            after: later,
        }))
    }

    pub async fn list_chats(&self, query: &ChatQuery) -> Result<Vec<ChatSummary>> {
        let mut builder = QueryBuilder::<Sqlite>::new(CHAT_SELECT);
        builder.push(" WHERE 1 = 1");
        if let Some(text) = query.query.as_deref() {
            let pattern = contains_pattern(&text.to_lowercase());
            builder
                .push(" AND (LOWER(c.name) LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR c.chat_id LIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        builder.push(match query.sort {
            ChatSort::LastActive => {
                " ORDER BY c.last_activity_ms IS NULL, c.last_activity_ms DESC, c.chat_id"
            }
            ChatSort::Name => " ORDER BY c.name IS NULL, LOWER(c.name), c.chat_id",
        });
        builder
            .push(" LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.page) * i64::from(query.limit));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| chat_from_row(row, query.include_last_message))
            .collect()
    }

    pub async fn chat(&self, chat_id: &ChatId) -> Result<Option<ChatSummary>> {
        let row = sqlx::query(&format!("{CHAT_SELECT} WHERE c.chat_id = ?"))
            .bind(chat_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| chat_from_row(&row, true)).transpose()
    }

    pub async fn chat_exists(&self, chat_id: &ChatId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE chat_id = ?")
            .bind(chat_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// The direct chat whose id contains `phone_number`.
    pub async fn direct_chat_by_contact(&self, phone_number: &str) -> Result<Option<ChatSummary>> {
        let row = sqlx::query(&format!(
            "{CHAT_SELECT} WHERE c.kind = 'direct' AND c.chat_id LIKE ? ESCAPE '\\'
             ORDER BY c.last_activity_ms DESC LIMIT 1"
        ))
        .bind(contains_pattern(phone_number))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| chat_from_row(&row, true)).transpose()
    }

    /// Chats the contact is part of: its direct chat and any chat it sent to.
    pub async fn contact_chats(
        &self,
        contact_id: &ContactId,
        limit: u32,
        page: u32,
    ) -> Result<Vec<ChatSummary>> {
        let rows = sqlx::query(&format!(
            "{CHAT_SELECT}
             WHERE c.chat_id = ?
                OR EXISTS (SELECT 1 FROM messages s WHERE s.chat_id = c.chat_id AND s.sender_id = ?)
             ORDER BY c.last_activity_ms IS NULL, c.last_activity_ms DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(contact_id.as_str())
        .bind(contact_id.as_str())
        .bind(i64::from(limit))
        .bind(i64::from(page) * i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| chat_from_row(row, true)).collect()
    }

    /// Most recent message sent by the contact or exchanged in its direct chat.
    pub async fn last_interaction(&self, contact_id: &ContactId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!(
            "{MESSAGE_SELECT}
             WHERE m.sender_id = ? OR m.chat_id = ?
             ORDER BY m.timestamp_ms DESC, m.rowid DESC LIMIT 1"
        ))
        .bind(contact_id.as_str())
        .bind(contact_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| message_from_row(&row)).transpose()
    }

    /// Case-insensitive match on name or phone number. Group chats are never contacts.
    pub async fn search_contacts(&self, query: &str, limit: u32) -> Result<Vec<StoredContact>> {
        let pattern = contains_pattern(&query.to_lowercase());
        let rows = sqlx::query(
            "SELECT contact_id, name FROM contacts
             WHERE contact_id NOT LIKE '%@g.us'
               AND (LOWER(name) LIKE ? ESCAPE '\\' OR LOWER(contact_id) LIKE ? ESCAPE '\\')
             ORDER BY name IS NULL, LOWER(name), contact_id
             LIMIT ?",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredContact {
                contact_id: ContactId::new(r.get::<String, _>(0)),
                name: r.get(1),
            })
            .collect())
    }

    /// Best display name for a sender, falling back to the raw id.
    pub async fn sender_display_name(&self, sender_id: &str) -> Result<String> {
        let exact: Option<String> = sqlx::query_scalar(
            "SELECT name FROM contacts WHERE contact_id = ? AND name IS NOT NULL
             UNION ALL
             SELECT name FROM chats WHERE chat_id = ? AND name IS NOT NULL
             LIMIT 1",
        )
        .bind(sender_id)
        .bind(sender_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(name) = exact {
            return Ok(name);
        }

        let phone_number = user_part(sender_id);
        let by_phone: Option<String> = sqlx::query_scalar(
            "SELECT name FROM contacts
             WHERE name IS NOT NULL AND (contact_id = ? OR contact_id LIKE ? ESCAPE '\\')
             LIMIT 1",
        )
        .bind(phone_number)
        .bind(prefix_pattern(&format!("{phone_number}@")))
        .fetch_optional(&self.pool)
        .await?;
        Ok(by_phone.unwrap_or_else(|| sender_id.to_string()))
    }

    /// Live reactions on a message, oldest first. Removal tombstones are skipped.
    pub async fn reactions(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<Vec<StoredReaction>> {
        let rows = sqlx::query(
            "SELECT reactor_id, emoji, timestamp_ms FROM reactions
             WHERE chat_id = ? AND message_id = ? AND emoji <> ''
             ORDER BY timestamp_ms ASC, reactor_id",
        )
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredReaction {
                reactor_id: ContactId::new(r.get::<String, _>(0)),
                emoji: r.get(1),
                timestamp: from_millis(r.get(2)),
            })
            .collect())
    }

    /// The stored reaction of one reactor, tombstones included.
    pub async fn reaction(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        reactor_id: &ContactId,
    ) -> Result<Option<StoredReaction>> {
        let row = sqlx::query(
            "SELECT reactor_id, emoji, timestamp_ms FROM reactions
             WHERE chat_id = ? AND message_id = ? AND reactor_id = ?",
        )
        .bind(chat_id.as_str())
        .bind(message_id.as_str())
        .bind(reactor_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredReaction {
            reactor_id: ContactId::new(r.get::<String, _>(0)),
            emoji: r.get(1),
            timestamp: from_millis(r.get(2)),
        }))
    }

    pub async fn count_messages(&self, chat_id: Option<&ChatId>) -> Result<i64> {
        let count = match chat_id {
            Some(chat_id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE chat_id = ?")
                    .bind(chat_id.as_str())
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM messages")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let media_url: Option<String> = row.try_get(MEDIA_OFFSET)?;
    let media = match media_url {
        Some(_) => Some(media_from_row(row, MEDIA_OFFSET)?),
        None => None,
    };

    Ok(StoredMessage {
        chat_id: ChatId::new(row.try_get::<String, _>(0)?),
        chat_name: row.try_get(1)?,
        message_id: MessageId::new(row.try_get::<String, _>(2)?),
        sender_id: ContactId::new(row.try_get::<String, _>(3)?),
        timestamp: from_millis(row.try_get(4)?),
        direction: row.try_get::<String, _>(5)?.parse()?,
        kind: row.try_get::<String, _>(6)?.parse()?,
        text: row.try_get(7)?,
        quoted_message_id: row
            .try_get::<Option<String>, _>(8)?
            .map(MessageId::new),
        edited: row.try_get::<i64, _>(9)? != 0,
        delivery_status: DeliveryStatus::from_rank(row.try_get(10)?),
        media,
    })
}

fn chat_from_row(row: &SqliteRow, include_last_message: bool) -> Result<ChatSummary> {
    let last_sender: Option<String> = row.try_get(4)?;
    let last_message = match last_sender {
        Some(sender_id) if include_last_message => {
            let direction: String = row.try_get(7)?;
            Some(LastMessage {
                sender_id: ContactId::new(sender_id),
                text: row.try_get(5)?,
                kind: row.try_get::<String, _>(6)?.parse()?,
                is_from_me: direction.parse::<Direction>()?.is_from_me(),
            })
        }
        _ => None,
    };

    Ok(ChatSummary {
        chat_id: ChatId::new(row.try_get::<String, _>(0)?),
        name: row.try_get(1)?,
        kind: row.try_get::<String, _>(2)?.parse()?,
        last_activity: row.try_get::<Option<i64>, _>(3)?.map(from_millis),
        last_message,
    })
}

/// Escapes `\`, `%` and `_` so user input only ever matches literally.
/// Every LIKE that binds one of these patterns declares `ESCAPE '\'`.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn contains_pattern(raw: &str) -> String {
    format!("%{}%", escape_like(raw))
}

fn prefix_pattern(raw: &str) -> String {
    format!("{}%", escape_like(raw))
}
