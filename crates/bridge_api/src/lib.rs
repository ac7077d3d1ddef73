use std::{collections::HashSet, path::PathBuf, sync::Arc};

use bridge_core::{
    Bridge, BridgeError, CommandApi, IngestSnapshot, IngestionPipeline, ReplyTo, SessionManager,
    SessionState,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChatId, ContactId, ContentKind, MessageId},
    error::{ApiError, ErrorCode},
};
use storage::{
    ChatQuery, ChatSort, ChatSummary, MessageContext, MessageQuery, Storage, StoredContact,
    StoredMessage, StoredReaction,
};
use tracing::{error, warn};

pub mod format;

use format::format_messages_list;

const MAX_PAGE_SIZE: u32 = 500;
const MAX_CONTEXT: u32 = 50;
const CONTACT_SEARCH_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub session: Arc<SessionManager>,
    pub ingestion: Arc<IngestionPipeline>,
    pub commands: Arc<CommandApi>,
}

impl ApiContext {
    pub fn from_bridge(bridge: &Bridge) -> Self {
        Self {
            storage: bridge.storage().clone(),
            session: Arc::clone(bridge.session()),
            ingestion: Arc::clone(bridge.ingestion()),
            commands: Arc::clone(bridge.commands()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListMessagesParams {
    /// ISO-8601; only messages strictly after this instant.
    pub after: Option<String>,
    pub before: Option<String>,
    #[serde(alias = "sender_phone_number")]
    pub sender: Option<String>,
    pub chat_id: Option<String>,
    pub query: Option<String>,
    pub limit: Option<u32>,
    pub page: Option<u32>,
    pub include_context: Option<bool>,
    pub context_before: Option<u32>,
    pub context_after: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageListing {
    pub messages: Vec<StoredMessage>,
    pub formatted: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextParams {
    pub message_id: String,
    pub chat_id: Option<String>,
    pub before: Option<u32>,
    pub after: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListChatsParams {
    pub query: Option<String>,
    pub limit: Option<u32>,
    pub page: Option<u32>,
    pub include_last_message: Option<bool>,
    pub sort_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastInteraction {
    pub message: Option<StoredMessage>,
    pub formatted: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: SessionState,
    pub own_id: Option<ContactId>,
    pub ingestion: IngestSnapshot,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendMessageRequest {
    pub recipient: String,
    pub message: String,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub reply_to_sender_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendFileRequest {
    pub recipient: String,
    pub media_path: PathBuf,
    #[serde(default)]
    pub kind: Option<ContentKind>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub reply_to_sender_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendAudioRequest {
    pub recipient: String,
    pub media_path: PathBuf,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
    #[serde(default)]
    pub reply_to_sender_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SendReactionRequest {
    pub chat_id: String,
    pub message_id: String,
    /// Empty removes the reaction.
    #[serde(default)]
    pub reaction: String,
    #[serde(default)]
    pub reply_to_sender_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadMediaRequest {
    pub chat_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub message: String,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub kind: ContentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub success: bool,
    pub message: String,
    pub file_path: PathBuf,
}

pub async fn search_contacts(ctx: &ApiContext, query: &str) -> Result<Vec<StoredContact>, ApiError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "query is required"));
    }
    ctx.storage
        .search_contacts(query, CONTACT_SEARCH_LIMIT)
        .await
        .map_err(internal)
}

/// Lists matching messages newest first. With context enabled each match is
/// surrounded by its neighbours in chronological order.
pub async fn list_messages(
    ctx: &ApiContext,
    params: &ListMessagesParams,
) -> Result<MessageListing, ApiError> {
    let query = MessageQuery {
        after: params
            .after
            .as_deref()
            .map(|raw| parse_timestamp("after", raw))
            .transpose()?,
        before: params
            .before
            .as_deref()
            .map(|raw| parse_timestamp("before", raw))
            .transpose()?,
        sender: non_blank(params.sender.as_deref()),
        chat_id: non_blank(params.chat_id.as_deref()).map(ChatId::new),
        text: non_blank(params.query.as_deref()),
        limit: page_size(params.limit),
        page: params.page.unwrap_or(0),
    };
    let matches = ctx.storage.list_messages(&query).await.map_err(internal)?;

    let messages = if params.include_context.unwrap_or(true) {
        let before = params.context_before.unwrap_or(1).min(MAX_CONTEXT);
        let after = params.context_after.unwrap_or(1).min(MAX_CONTEXT);
        let mut seen = HashSet::new();
        let mut expanded = Vec::new();
        for message in matches {
            let context = ctx
                .storage
                .message_context(&message.chat_id, &message.message_id, before, after)
                .await
                .map_err(internal)?;
            let window = match context {
                Some(context) => {
                    let mut window = context.before;
                    window.push(context.message);
                    window.extend(context.after);
                    window
                }
                None => vec![message],
            };
            for entry in window {
                if seen.insert((entry.chat_id.clone(), entry.message_id.clone())) {
                    expanded.push(entry);
                }
            }
        }
        expanded
    } else {
        matches
    };

    let formatted = format_messages_list(&ctx.storage, &messages, true)
        .await
        .map_err(internal)?;
    Ok(MessageListing {
        messages,
        formatted,
    })
}

pub async fn message_context(
    ctx: &ApiContext,
    params: &ContextParams,
) -> Result<MessageContext, ApiError> {
    let message_id = MessageId::new(params.message_id.trim());
    if message_id.as_str().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "message_id is required"));
    }
    let chat_id = match non_blank(params.chat_id.as_deref()) {
        Some(chat_id) => ChatId::new(chat_id),
        None => ctx
            .storage
            .message_by_id(&message_id)
            .await
            .map_err(internal)?
            .map(|message| message.chat_id)
            .ok_or_else(|| message_not_found(&message_id))?,
    };
    ctx.storage
        .message_context(
            &chat_id,
            &message_id,
            params.before.unwrap_or(5).min(MAX_CONTEXT),
            params.after.unwrap_or(5).min(MAX_CONTEXT),
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| message_not_found(&message_id))
}

pub async fn list_chats(
    ctx: &ApiContext,
    params: &ListChatsParams,
) -> Result<Vec<ChatSummary>, ApiError> {
    let sort = match params.sort_by.as_deref().map(str::trim) {
        None | Some("") | Some("last_active") => ChatSort::LastActive,
        Some("name") => ChatSort::Name,
        Some(other) => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("sort_by must be 'last_active' or 'name', got '{other}'"),
            ))
        }
    };
    let query = ChatQuery {
        query: non_blank(params.query.as_deref()),
        limit: page_size(params.limit),
        page: params.page.unwrap_or(0),
        include_last_message: params.include_last_message.unwrap_or(true),
        sort,
    };
    ctx.storage.list_chats(&query).await.map_err(internal)
}

pub async fn get_chat(
    ctx: &ApiContext,
    chat_id: &str,
    include_last_message: bool,
) -> Result<ChatSummary, ApiError> {
    let mut chat = ctx
        .storage
        .chat(&ChatId::new(chat_id.trim()))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("chat {chat_id} not found")))?;
    if !include_last_message {
        chat.last_message = None;
    }
    Ok(chat)
}

pub async fn direct_chat_by_contact(
    ctx: &ApiContext,
    phone_number: &str,
) -> Result<ChatSummary, ApiError> {
    let phone_number = phone_number.trim().trim_start_matches('+');
    if phone_number.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "phone number is required"));
    }
    ctx.storage
        .direct_chat_by_contact(phone_number)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::NotFound,
                format!("no direct chat with {phone_number}"),
            )
        })
}

pub async fn contact_chats(
    ctx: &ApiContext,
    contact_id: &str,
    limit: Option<u32>,
    page: Option<u32>,
) -> Result<Vec<ChatSummary>, ApiError> {
    ctx.storage
        .contact_chats(
            &ContactId::new(contact_id.trim()),
            page_size(limit),
            page.unwrap_or(0),
        )
        .await
        .map_err(internal)
}

pub async fn last_interaction(
    ctx: &ApiContext,
    contact_id: &str,
) -> Result<LastInteraction, ApiError> {
    let message = ctx
        .storage
        .last_interaction(&ContactId::new(contact_id.trim()))
        .await
        .map_err(internal)?;
    let formatted = match &message {
        Some(message) => Some(
            format::format_message(&ctx.storage, message, true)
                .await
                .map_err(internal)?,
        ),
        None => None,
    };
    Ok(LastInteraction { message, formatted })
}

pub async fn reactions(
    ctx: &ApiContext,
    chat_id: &str,
    message_id: &str,
) -> Result<Vec<StoredReaction>, ApiError> {
    ctx.storage
        .reactions(&ChatId::new(chat_id.trim()), &MessageId::new(message_id.trim()))
        .await
        .map_err(internal)
}

#[derive(Debug, Clone, Serialize)]
pub struct SenderName {
    pub sender_id: String,
    pub name: String,
}

/// Falls back to the raw id when nothing better is known.
pub async fn sender_name(ctx: &ApiContext, sender_id: &str) -> Result<SenderName, ApiError> {
    let sender_id = sender_id.trim();
    if sender_id.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "sender id is required"));
    }
    let name = ctx
        .storage
        .sender_display_name(sender_id)
        .await
        .map_err(internal)?;
    Ok(SenderName {
        sender_id: sender_id.to_string(),
        name,
    })
}

pub fn session_status(ctx: &ApiContext) -> SessionStatus {
    SessionStatus {
        session: ctx.session.state(),
        own_id: ctx.session.own_id(),
        ingestion: ctx.ingestion.snapshot(),
    }
}

pub async fn send_message(
    ctx: &ApiContext,
    req: &SendMessageRequest,
) -> Result<SendResponse, ApiError> {
    if req.recipient.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "recipient must be provided",
        ));
    }
    let sent = ctx
        .commands
        .send_message(
            &req.recipient,
            &req.message,
            reply_to(&req.reply_to_message_id, &req.reply_to_sender_id),
        )
        .await
        .map_err(command_error)?;
    Ok(SendResponse {
        success: true,
        message: format!("Message sent to {}", sent.chat_id),
        chat_id: sent.chat_id,
        message_id: sent.message_id,
        timestamp: sent.timestamp,
        kind: sent.kind,
    })
}

pub async fn send_file(ctx: &ApiContext, req: &SendFileRequest) -> Result<SendResponse, ApiError> {
    ensure_absolute(&req.media_path)?;
    let sent = ctx
        .commands
        .send_file(
            &req.recipient,
            &req.media_path,
            req.kind,
            req.caption.clone(),
            reply_to(&req.reply_to_message_id, &req.reply_to_sender_id),
        )
        .await
        .map_err(command_error)?;
    Ok(SendResponse {
        success: true,
        message: format!("{} sent to {}", sent.kind, sent.chat_id),
        chat_id: sent.chat_id,
        message_id: sent.message_id,
        timestamp: sent.timestamp,
        kind: sent.kind,
    })
}

pub async fn send_audio_message(
    ctx: &ApiContext,
    req: &SendAudioRequest,
) -> Result<SendResponse, ApiError> {
    ensure_absolute(&req.media_path)?;
    let sent = ctx
        .commands
        .send_audio_message(
            &req.recipient,
            &req.media_path,
            reply_to(&req.reply_to_message_id, &req.reply_to_sender_id),
        )
        .await
        .map_err(command_error)?;
    let message = if sent.kind == ContentKind::Audio {
        format!("Voice message sent to {}", sent.chat_id)
    } else {
        format!(
            "Audio could not be encoded as a voice message; sent as a file to {}",
            sent.chat_id
        )
    };
    Ok(SendResponse {
        success: true,
        message,
        chat_id: sent.chat_id,
        message_id: sent.message_id,
        timestamp: sent.timestamp,
        kind: sent.kind,
    })
}

pub async fn send_reaction(
    ctx: &ApiContext,
    req: &SendReactionRequest,
) -> Result<StatusResponse, ApiError> {
    ctx.commands
        .send_reaction(
            &req.chat_id,
            &MessageId::new(req.message_id.trim()),
            &req.reaction,
            non_blank(req.reply_to_sender_id.as_deref()).map(ContactId::new),
        )
        .await
        .map_err(command_error)?;
    let message = if req.reaction.is_empty() {
        "Reaction removed".to_string()
    } else {
        format!("Reacted with {}", req.reaction)
    };
    Ok(StatusResponse {
        success: true,
        message,
    })
}

pub async fn download_media(
    ctx: &ApiContext,
    req: &DownloadMediaRequest,
) -> Result<DownloadResponse, ApiError> {
    let file_path = ctx
        .commands
        .download_media(&req.chat_id, &req.message_id)
        .await
        .map_err(command_error)?;
    Ok(DownloadResponse {
        success: true,
        message: "Media downloaded successfully".to_string(),
        file_path,
    })
}

/// Accepts RFC 3339, a naive `YYYY-mm-ddTHH:MM:SS` (read as UTC) or a bare date.
pub fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Ok(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::Validation,
                format!("invalid date for '{field}': {raw}; use ISO-8601"),
            )
        })
}

fn page_size(limit: Option<u32>) -> u32 {
    limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn reply_to(message_id: &Option<String>, sender_id: &Option<String>) -> Option<ReplyTo> {
    non_blank(message_id.as_deref()).map(|message_id| ReplyTo {
        message_id: MessageId::new(message_id),
        sender_id: non_blank(sender_id.as_deref()).map(ContactId::new),
    })
}

fn ensure_absolute(path: &std::path::Path) -> Result<(), ApiError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::Validation,
            format!("media_path must be absolute: {}", path.display()),
        ))
    }
}

fn message_not_found(message_id: &MessageId) -> ApiError {
    ApiError::new(
        ErrorCode::NotFound,
        format!("message {message_id} not found"),
    )
}

fn command_error(err: BridgeError) -> ApiError {
    match err.code() {
        ErrorCode::Internal => error!(error = %err, "command failed"),
        _ => warn!(error = %err, "command rejected"),
    }
    err.to_api_error()
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "store query failed");
    ApiError::new(ErrorCode::Internal, "internal store error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{MemoryCredentialStore, MissingAudioTranscoder, SessionOptions};
    use chrono::TimeZone;
    use shared::domain::{Direction, DeliveryStatus};
    use storage::MessageUpsert;
    use transport::LoopbackTransport;

    const OWN_ID: &str = "10000000000@s.whatsapp.net";
    const GROUP: &str = "120363000001@g.us";
    const BOB: &str = "15550002@s.whatsapp.net";

    async fn setup() -> (ApiContext, Arc<Bridge>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let transport = Arc::new(LoopbackTransport::new(OWN_ID));
        transport.accept_credentials().await;
        let session = SessionManager::new(
            transport.clone(),
            Arc::new(MemoryCredentialStore::with_credentials(
                transport.credentials(),
            )),
            SessionOptions::default(),
        );
        let bridge = Bridge::start(
            storage,
            session,
            Arc::new(MissingAudioTranscoder),
            dir.path().join("media"),
        )
        .await
        .expect("bridge");
        bridge.connect().await.expect("connect");
        (ApiContext::from_bridge(&bridge), bridge, dir)
    }

    async fn seed(ctx: &ApiContext, id: &str, minute: u32, text: &str, from_me: bool) {
        ctx.storage
            .upsert_message(&MessageUpsert {
                chat_id: ChatId::from(GROUP),
                message_id: MessageId::from(id),
                sender_id: ContactId::from(if from_me { OWN_ID } else { BOB }),
                sender_name: (!from_me).then(|| "Bob".to_string()),
                chat_name: Some("Climbing".to_string()),
                timestamp: Utc
                    .with_ymd_and_hms(2025, 1, 15, 12, minute, 0)
                    .single()
                    .expect("timestamp"),
                direction: if from_me {
                    Direction::Outbound
                } else {
                    Direction::Inbound
                },
                kind: ContentKind::Text,
                text: Some(text.to_string()),
                quoted_message_id: None,
                delivery_status: from_me.then_some(DeliveryStatus::Sent),
                media: None,
                local_media_path: None,
            })
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn listing_expands_matches_with_context_once() {
        let (ctx, bridge, _dir) = setup().await;
        seed(&ctx, "m1", 0, "morning", false).await;
        seed(&ctx, "m2", 1, "crag at noon?", true).await;
        seed(&ctx, "m3", 2, "yes, crag it is", false).await;
        seed(&ctx, "m4", 3, "see you", false).await;

        let listing = list_messages(
            &ctx,
            &ListMessagesParams {
                query: Some("crag".to_string()),
                ..ListMessagesParams::default()
            },
        )
        .await
        .expect("listing");
        let ids: Vec<&str> = listing
            .messages
            .iter()
            .map(|m| m.message_id.as_str())
            .collect();
        assert_eq!(ids, vec!["m2", "m3", "m4", "m1"]);
        assert!(listing
            .formatted
            .contains("[2025-01-15 12:01:00] Chat: Climbing From: Me: crag at noon?"));
        assert!(listing.formatted.contains("From: Bob: yes, crag it is"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn listing_without_matches_says_so() {
        let (ctx, bridge, _dir) = setup().await;
        let listing = list_messages(
            &ctx,
            &ListMessagesParams {
                after: Some("2030-01-01".to_string()),
                ..ListMessagesParams::default()
            },
        )
        .await
        .expect("listing");
        assert!(listing.messages.is_empty());
        assert_eq!(listing.formatted, format::EMPTY_LISTING);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn bad_inputs_are_validation_errors() {
        let (ctx, bridge, _dir) = setup().await;
        let err = list_messages(
            &ctx,
            &ListMessagesParams {
                before: Some("yesterday".to_string()),
                ..ListMessagesParams::default()
            },
        )
        .await
        .expect_err("bad date");
        assert_eq!(err.code, ErrorCode::Validation);

        let err = list_chats(
            &ctx,
            &ListChatsParams {
                sort_by: Some("size".to_string()),
                ..ListChatsParams::default()
            },
        )
        .await
        .expect_err("bad sort");
        assert_eq!(err.code, ErrorCode::Validation);

        let err = send_file(
            &ctx,
            &SendFileRequest {
                recipient: BOB.to_string(),
                media_path: PathBuf::from("relative/photo.jpg"),
                kind: None,
                caption: None,
                reply_to_message_id: None,
                reply_to_sender_id: None,
            },
        )
        .await
        .expect_err("relative path");
        assert_eq!(err.code, ErrorCode::Validation);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn context_is_found_from_the_message_id_alone() {
        let (ctx, bridge, _dir) = setup().await;
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            seed(&ctx, id, i as u32, id, false).await;
        }
        let context = message_context(
            &ctx,
            &ContextParams {
                message_id: "b".to_string(),
                chat_id: None,
                before: Some(1),
                after: Some(1),
            },
        )
        .await
        .expect("context");
        assert_eq!(context.message.message_id.as_str(), "b");
        assert_eq!(context.before.len(), 1);
        assert_eq!(context.after.len(), 1);

        let missing = message_context(
            &ctx,
            &ContextParams {
                message_id: "zzz".to_string(),
                chat_id: None,
                before: None,
                after: None,
            },
        )
        .await
        .expect_err("missing");
        assert_eq!(missing.code, ErrorCode::NotFound);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn chat_lookups_and_last_message_toggle() {
        let (ctx, bridge, _dir) = setup().await;
        seed(&ctx, "m1", 0, "hello group", false).await;

        let chat = get_chat(&ctx, GROUP, true).await.expect("chat");
        assert!(chat.last_message.is_some());
        let bare = get_chat(&ctx, GROUP, false).await.expect("chat");
        assert!(bare.last_message.is_none());
        assert_eq!(
            get_chat(&ctx, "nope@g.us", true)
                .await
                .expect_err("missing")
                .code,
            ErrorCode::NotFound
        );

        assert_eq!(sender_name(&ctx, BOB).await.expect("name").name, "Bob");
        let unknown = sender_name(&ctx, "15559999@s.whatsapp.net")
            .await
            .expect("name");
        assert_eq!(unknown.name, "15559999@s.whatsapp.net");

        let interaction = last_interaction(&ctx, BOB).await.expect("interaction");
        assert!(interaction
            .formatted
            .expect("formatted")
            .contains("From: Bob: hello group"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn sends_report_command_errors_with_their_code() {
        let (ctx, bridge, _dir) = setup().await;
        let sent = send_message(
            &ctx,
            &SendMessageRequest {
                recipient: "15550002".to_string(),
                message: "hi bob".to_string(),
                reply_to_message_id: None,
                reply_to_sender_id: None,
            },
        )
        .await
        .expect("send");
        assert!(sent.success);
        assert_eq!(sent.chat_id, ChatId::from(BOB));

        let err = send_message(
            &ctx,
            &SendMessageRequest {
                recipient: "nobody@g.us".to_string(),
                message: "hi".to_string(),
                reply_to_message_id: None,
                reply_to_sender_id: None,
            },
        )
        .await
        .expect_err("unknown group");
        assert_eq!(err.code, ErrorCode::UnknownRecipient);

        let status = session_status(&ctx);
        assert_eq!(status.own_id, Some(ContactId::from(OWN_ID)));
        bridge.shutdown().await;
    }
}
