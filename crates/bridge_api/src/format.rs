//! Plain-text rendering of stored messages, one line per message.

use std::collections::HashMap;

use anyhow::Result;
use storage::{Storage, StoredMessage};

pub const EMPTY_LISTING: &str = "No messages to display.";

/// Resolves sender ids to display names, remembering each lookup.
pub struct SenderNames<'a> {
    storage: &'a Storage,
    cache: HashMap<String, String>,
}

impl<'a> SenderNames<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self {
            storage,
            cache: HashMap::new(),
        }
    }

    pub async fn name(&mut self, sender_id: &str) -> Result<String> {
        if let Some(name) = self.cache.get(sender_id) {
            return Ok(name.clone());
        }
        let name = self.storage.sender_display_name(sender_id).await?;
        self.cache.insert(sender_id.to_string(), name.clone());
        Ok(name)
    }
}

pub async fn format_message(
    storage: &Storage,
    message: &StoredMessage,
    show_chat_info: bool,
) -> Result<String> {
    let mut names = SenderNames::new(storage);
    render(&mut names, message, show_chat_info).await
}

pub async fn format_messages_list(
    storage: &Storage,
    messages: &[StoredMessage],
    show_chat_info: bool,
) -> Result<String> {
    if messages.is_empty() {
        return Ok(EMPTY_LISTING.to_string());
    }
    let mut names = SenderNames::new(storage);
    let mut output = String::new();
    for message in messages {
        output.push_str(&render(&mut names, message, show_chat_info).await?);
    }
    Ok(output)
}

async fn render(
    names: &mut SenderNames<'_>,
    message: &StoredMessage,
    show_chat_info: bool,
) -> Result<String> {
    let timestamp = message.timestamp.format("%Y-%m-%d %H:%M:%S");
    let mut line = match message.chat_name.as_deref() {
        Some(chat_name) if show_chat_info => format!("[{timestamp}] Chat: {chat_name} "),
        _ => format!("[{timestamp}] "),
    };

    let sender = if message.is_from_me() {
        "Me".to_string()
    } else {
        names.name(message.sender_id.as_str()).await?
    };
    let content_prefix = if message.kind.is_media() {
        format!(
            "[{} - Message ID: {} - Chat JID: {}] ",
            message.kind, message.message_id, message.chat_id
        )
    } else {
        String::new()
    };
    line.push_str(&format!(
        "From: {sender}: {content_prefix}{}\n",
        message.text.as_deref().unwrap_or_default()
    ));
    Ok(line)
}
