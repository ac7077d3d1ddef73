use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bridge_api::{
    contact_chats, direct_chat_by_contact, download_media, get_chat, last_interaction,
    list_chats, list_messages, message_context, reactions, search_contacts, send_audio_message,
    send_file, send_message, send_reaction, sender_name, session_status, ApiContext,
    ContextParams, DownloadMediaRequest, DownloadResponse, LastInteraction, ListChatsParams,
    ListMessagesParams, MessageListing, SendAudioRequest, SendFileRequest, SendMessageRequest,
    SendReactionRequest, SendResponse, SenderName, SessionStatus, StatusResponse,
};
use bridge_core::{
    AudioTranscoder, Bridge, BridgeError, CredentialStore, FfmpegTranscoder,
    FileCredentialStore, MemoryCredentialStore, SessionManager, SessionState,
};
use serde::Deserialize;
use shared::{
    domain::ContactId,
    error::{ApiError, ErrorCode},
};
use storage::{ChatSummary, MessageContext, Storage, StoredContact, StoredReaction};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use transport::{
    GatewayOptions, GatewayTransport, LoopbackTransport, MissingTransport, ProtocolTransport,
};

mod config;

use config::{load_settings, prepare_database_url, Settings, TransportKind};

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const LOOPBACK_OWN_ID: &str = "10000000000@s.whatsapp.net";

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

type HttpResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct ContextQuery {
    chat_id: Option<String>,
    before: Option<u32>,
    after: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatQueryParams {
    include_last_message: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ContactSearchQuery {
    #[serde(default)]
    query: String,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    page: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (transport, credentials) = build_transport(&settings)?;
    let session = SessionManager::new(transport, credentials, settings.session_options());
    let transcoder: Arc<dyn AudioTranscoder> =
        Arc::new(FfmpegTranscoder::new(&settings.ffmpeg_program));
    let bridge = Bridge::start(storage, session, transcoder, &settings.media_dir).await?;

    match bridge.connect().await {
        Ok(SessionState::Pairing { code }) => {
            info!(%code, "link this device with the pairing code");
        }
        Ok(state) => info!(state = state.label(), "session ready"),
        Err(err @ (BridgeError::PersistentAuthLoss(_) | BridgeError::SessionUnavailable(_))) => {
            error!(error = %err, "session unavailable; serving stored history only");
        }
        Err(err) => return Err(err.into()),
    }

    let app = build_router(Arc::new(AppState {
        api: ApiContext::from_bridge(&bridge),
    }));

    let addr: SocketAddr = settings.bind.parse()?;
    info!(%addr, "bridge listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    bridge.shutdown().await;
    info!("bridge stopped");
    Ok(())
}

fn build_transport(
    settings: &Settings,
) -> anyhow::Result<(Arc<dyn ProtocolTransport>, Arc<dyn CredentialStore>)> {
    match settings.transport {
        TransportKind::Gateway => {
            let transport = GatewayTransport::new(GatewayOptions {
                base_url: settings.gateway_url.clone(),
                request_timeout: Duration::from_secs(settings.send_timeout_secs),
                media_timeout: Duration::from_secs(settings.media_timeout_secs),
                event_capacity: settings.event_capacity,
            })?;
            Ok((
                Arc::new(transport),
                Arc::new(FileCredentialStore::new(&settings.credentials_path)),
            ))
        }
        TransportKind::Loopback => {
            warn!("using the in-process loopback transport; nothing leaves this machine");
            let transport = LoopbackTransport::new(ContactId::from(LOOPBACK_OWN_ID))
                .with_auto_pairing()
                .with_echo()
                .with_event_capacity(settings.event_capacity);
            Ok((
                Arc::new(transport),
                Arc::new(MemoryCredentialStore::default()),
            ))
        }
        TransportKind::None => {
            warn!("no protocol transport configured; serving stored history only");
            Ok((
                Arc::new(MissingTransport),
                Arc::new(MemoryCredentialStore::default()),
            ))
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/session", get(http_session_status))
        .route("/api/send", post(http_send_message))
        .route("/api/send_file", post(http_send_file))
        .route("/api/send_audio", post(http_send_audio))
        .route("/api/react", post(http_send_reaction))
        .route("/api/download", post(http_download_media))
        .route("/api/messages", get(http_list_messages))
        .route("/api/messages/:message_id/context", get(http_message_context))
        .route("/api/chats", get(http_list_chats))
        .route("/api/chats/:chat_id", get(http_get_chat))
        .route(
            "/api/chats/:chat_id/messages/:message_id/reactions",
            get(http_reactions),
        )
        .route("/api/contacts", get(http_search_contacts))
        .route("/api/contacts/:contact_id/chats", get(http_contact_chats))
        .route(
            "/api/contacts/:contact_id/last_interaction",
            get(http_last_interaction),
        )
        .route("/api/contacts/:contact_id/name", get(http_sender_name))
        .route("/api/direct_chats/:phone_number", get(http_direct_chat))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::UnknownRecipient => StatusCode::BAD_REQUEST,
        ErrorCode::SessionUnavailable | ErrorCode::PersistentAuthLoss => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCode::TransportRejected | ErrorCode::MediaFetchFailed => StatusCode::BAD_GATEWAY,
        ErrorCode::MediaEncodeUnavailable => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(error.code), Json(error))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_session_status(State(state): State<Arc<AppState>>) -> Json<SessionStatus> {
    Json(session_status(&state.api))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<SendResponse> {
    send_message(&state.api, &req).await.map(Json).map_err(reject)
}

async fn http_send_file(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendFileRequest>,
) -> HttpResult<SendResponse> {
    send_file(&state.api, &req).await.map(Json).map_err(reject)
}

async fn http_send_audio(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendAudioRequest>,
) -> HttpResult<SendResponse> {
    send_audio_message(&state.api, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_send_reaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendReactionRequest>,
) -> HttpResult<StatusResponse> {
    send_reaction(&state.api, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_download_media(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DownloadMediaRequest>,
) -> HttpResult<DownloadResponse> {
    download_media(&state.api, &req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListMessagesParams>,
) -> HttpResult<MessageListing> {
    list_messages(&state.api, &params)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_message_context(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Query(q): Query<ContextQuery>,
) -> HttpResult<MessageContext> {
    let params = ContextParams {
        message_id,
        chat_id: q.chat_id,
        before: q.before,
        after: q.after,
    };
    message_context(&state.api, &params)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListChatsParams>,
) -> HttpResult<Vec<ChatSummary>> {
    list_chats(&state.api, &params)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_get_chat(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<String>,
    Query(q): Query<ChatQueryParams>,
) -> HttpResult<ChatSummary> {
    get_chat(&state.api, &chat_id, q.include_last_message.unwrap_or(true))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_reactions(
    State(state): State<Arc<AppState>>,
    Path((chat_id, message_id)): Path<(String, String)>,
) -> HttpResult<Vec<StoredReaction>> {
    reactions(&state.api, &chat_id, &message_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_search_contacts(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ContactSearchQuery>,
) -> HttpResult<Vec<StoredContact>> {
    search_contacts(&state.api, &q.query)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_contact_chats(
    State(state): State<Arc<AppState>>,
    Path(contact_id): Path<String>,
    Query(q): Query<PageQuery>,
) -> HttpResult<Vec<ChatSummary>> {
    contact_chats(&state.api, &contact_id, q.limit, q.page)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_last_interaction(
    State(state): State<Arc<AppState>>,
    Path(contact_id): Path<String>,
) -> HttpResult<LastInteraction> {
    last_interaction(&state.api, &contact_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_sender_name(
    State(state): State<Arc<AppState>>,
    Path(contact_id): Path<String>,
) -> HttpResult<SenderName> {
    sender_name(&state.api, &contact_id)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_direct_chat(
    State(state): State<Arc<AppState>>,
    Path(phone_number): Path<String>,
) -> HttpResult<ChatSummary> {
    direct_chat_by_contact(&state.api, &phone_number)
        .await
        .map(Json)
        .map_err(reject)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
