use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use shared::{
    domain::{ContactId, ContentKind},
    protocol::{MediaDescriptor, OutboundPayload, SendAck, UploadedMedia},
};
use transport::{
    ConnectError, ConnectOutcome, ProtocolTransport, SendError, TransportConnection,
    TransportEvent,
};

use crate::error::{BridgeError, BridgeResult};

/// Persists the opaque blob that lets the session resume without pairing.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Vec<u8>>>;
    async fn save(&self, credentials: &[u8]) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("failed to read credentials '{}'", self.path.display())),
        }
    }

    async fn save(&self, credentials: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create credentials directory '{}'", parent.display())
                })?;
            }
        }
        let staging = self.path.with_extension("tmp");
        tokio::fs::write(&staging, credentials)
            .await
            .with_context(|| format!("failed to write credentials '{}'", staging.display()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed to replace credentials '{}'", self.path.display()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err)
                .with_context(|| format!("failed to remove credentials '{}'", self.path.display())),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<Option<Vec<u8>>>,
}

impl MemoryCredentialStore {
    pub fn with_credentials(credentials: Vec<u8>) -> Self {
        Self {
            credentials: Mutex::new(Some(credentials)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.credentials.lock().await.clone())
    }

    async fn save(&self, credentials: &[u8]) -> Result<()> {
        *self.credentials.lock().await = Some(credentials.to_vec());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.credentials.lock().await = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff for the 1-based `attempt`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub send_timeout: Duration,
    pub media_timeout: Duration,
    pub event_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            media_timeout: Duration::from_secs(120),
            event_capacity: 1024,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Pairing { code: String },
    Connected { own_id: ContactId },
    Reconnecting { attempt: u32 },
    /// Terminal until the device is paired again.
    LoggedOut { reason: String },
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Pairing { .. } => "pairing",
            Self::Connected { .. } => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::LoggedOut { .. } => "logged_out",
        }
    }

    fn from_outcome(outcome: ConnectOutcome) -> Self {
        match outcome {
            ConnectOutcome::Authenticated { own_id } => Self::Connected { own_id },
            ConnectOutcome::PairingRequired { code } => Self::Pairing { code },
        }
    }
}

/// Owns the authenticated connection: pairing, credential persistence,
/// reconnection with backoff and logout detection. Inbound protocol events
/// are forwarded into one bounded queue that survives reconnects.
pub struct SessionManager {
    transport: Arc<dyn ProtocolTransport>,
    credentials: Arc<dyn CredentialStore>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    events_tx: mpsc::Sender<serde_json::Value>,
    events_rx: Mutex<Option<mpsc::Receiver<serde_json::Value>>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn ProtocolTransport>,
        credentials: Arc<dyn CredentialStore>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(options.event_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            credentials,
            options,
            state,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            supervisor: Mutex::new(None),
        })
    }

    /// Establishes the session, resuming from stored credentials when the
    /// remote still accepts them. Returns once authenticated or once a
    /// pairing code is available.
    pub async fn connect(self: &Arc<Self>) -> BridgeResult<SessionState> {
        let mut supervisor = self.supervisor.lock().await;
        if let SessionState::LoggedOut { reason } = self.state() {
            return Err(BridgeError::PersistentAuthLoss(reason));
        }
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(self.state());
        }
        // Subscribed before connecting so a shutdown that lands while the
        // transport is still connecting is not missed.
        let shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(shutting_down());
        }

        let connection = self
            .establish()
            .await
            .map_err(|err| BridgeError::SessionUnavailable(err.to_string()))?;
        if *shutdown.borrow() {
            if let Err(err) = self.transport.disconnect().await {
                warn!(error = %err, "transport disconnect failed");
            }
            return Err(shutting_down());
        }
        let state = SessionState::from_outcome(connection.outcome);
        self.set_state(state.clone());

        let manager = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move {
            manager.supervise(connection.events, shutdown).await;
        }));
        Ok(state)
    }

    /// Hands out the inbound event queue. There is exactly one consumer.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<serde_json::Value>> {
        self.events_rx.lock().await.take()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn own_id(&self) -> Option<ContactId> {
        match &*self.state.borrow() {
            SessionState::Connected { own_id } => Some(own_id.clone()),
            _ => None,
        }
    }

    pub async fn send(&self, payload: &OutboundPayload) -> BridgeResult<SendAck> {
        self.ensure_connected()?;
        match timeout(self.options.send_timeout, self.transport.send(payload)).await {
            Ok(result) => result.map_err(map_send_error),
            Err(_) => Err(BridgeError::TransportRejected(format!(
                "send timed out after {:?}",
                self.options.send_timeout
            ))),
        }
    }

    pub async fn upload_media(
        &self,
        kind: ContentKind,
        encrypted: Vec<u8>,
    ) -> BridgeResult<UploadedMedia> {
        self.ensure_connected()?;
        match timeout(
            self.options.media_timeout,
            self.transport.upload_media(kind, encrypted),
        )
        .await
        {
            Ok(result) => result.map_err(map_send_error),
            Err(_) => Err(BridgeError::TransportRejected(format!(
                "media upload timed out after {:?}",
                self.options.media_timeout
            ))),
        }
    }

    pub async fn fetch_media(&self, media: &MediaDescriptor) -> BridgeResult<Vec<u8>> {
        match timeout(self.options.media_timeout, self.transport.fetch_media(media)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(BridgeError::MediaFetchFailed(err.to_string())),
            Err(_) => Err(BridgeError::MediaFetchFailed(format!(
                "media download timed out after {:?}",
                self.options.media_timeout
            ))),
        }
    }

    /// Stops the supervisor and closes the transport. A logged-out state is kept.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.supervisor.lock().await.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "session supervisor ended abnormally");
            }
        }
        if let Err(err) = self.transport.disconnect().await {
            warn!(error = %err, "transport disconnect failed");
        }
        if !matches!(self.state(), SessionState::LoggedOut { .. }) {
            self.set_state(SessionState::Disconnected);
        }
        info!("session shut down");
    }

    fn ensure_connected(&self) -> BridgeResult<()> {
        match &*self.state.borrow() {
            SessionState::Connected { .. } => Ok(()),
            SessionState::LoggedOut { reason } => {
                Err(BridgeError::PersistentAuthLoss(reason.clone()))
            }
            other => Err(BridgeError::SessionUnavailable(format!(
                "session is {}",
                other.label()
            ))),
        }
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            info!(from = previous.label(), to = next.label(), "session state changed");
        }
    }

    async fn establish(&self) -> std::result::Result<TransportConnection, ConnectError> {
        let stored = match self.credentials.load().await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "could not load session credentials; pairing instead");
                None
            }
        };
        let Some(stored) = stored else {
            return self.transport.connect(None).await;
        };

        match self.transport.connect(Some(&stored)).await {
            Err(ConnectError::AuthRejected(reason)) => {
                warn!(%reason, "stored credentials rejected; falling back to pairing");
                if let Err(err) = self.credentials.clear().await {
                    warn!(error = %err, "failed to clear rejected credentials");
                }
                self.transport.connect(None).await
            }
            other => other,
        }
    }

    async fn supervise(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => event,
            };
            match event {
                Some(TransportEvent::Protocol(value)) => {
                    if self.events_tx.send(value).await.is_err() {
                        debug!("event queue closed; dropping protocol event");
                    }
                }
                Some(TransportEvent::Paired {
                    own_id,
                    credentials,
                }) => {
                    if let Err(err) = self.credentials.save(&credentials).await {
                        error!(error = %err, "failed to persist session credentials");
                    }
                    self.set_state(SessionState::Connected { own_id });
                }
                Some(TransportEvent::LoggedOut { reason }) => {
                    if let Err(err) = self.credentials.clear().await {
                        warn!(error = %err, "failed to clear credentials after logout");
                    }
                    error!(%reason, "remote ended the session; pairing required");
                    self.set_state(SessionState::LoggedOut { reason });
                    break;
                }
                Some(TransportEvent::Disconnected { reason }) => {
                    warn!(%reason, "transport disconnected");
                    match self.reconnect(&mut shutdown).await {
                        Some(next) => events = next,
                        None => break,
                    }
                }
                None => {
                    warn!("transport event stream ended");
                    match self.reconnect(&mut shutdown).await {
                        Some(next) => events = next,
                        None => break,
                    }
                }
            }
        }
    }

    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        self.set_state(SessionState::Disconnected);
        let policy = self.options.reconnect;
        for attempt in 1..=policy.max_attempts {
            if *shutdown.borrow() {
                return None;
            }
            self.set_state(SessionState::Reconnecting { attempt });
            let delay = policy.delay_for(attempt);
            tokio::select! {
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(connection) => {
                    info!(attempt, "session re-established");
                    self.set_state(SessionState::from_outcome(connection.outcome));
                    return Some(connection.events);
                }
                Err(err) => {
                    warn!(attempt, error = %err, ?delay, "reconnect attempt failed");
                }
            }
        }

        let reason = format!("gave up after {} reconnect attempts", policy.max_attempts);
        error!(%reason, "session lost");
        self.set_state(SessionState::LoggedOut { reason });
        None
    }
}

fn shutting_down() -> BridgeError {
    BridgeError::SessionUnavailable("session is shutting down".to_string())
}

fn map_send_error(err: SendError) -> BridgeError {
    match err {
        SendError::NotConnected => {
            BridgeError::SessionUnavailable("transport is not connected".to_string())
        }
        SendError::Rejected(reason) | SendError::Transport(reason) => {
            BridgeError::TransportRejected(reason)
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
