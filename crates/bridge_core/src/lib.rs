use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use storage::Storage;

pub mod commands;
pub mod error;
pub mod ingest;
pub mod media;
pub mod session;

pub use commands::{CommandApi, ReplyTo, SentMessage};
pub use error::{BridgeError, BridgeResult};
pub use ingest::{classify, IngestOutcome, IngestSnapshot, IngestionPipeline};
pub use media::{
    AudioTranscoder, FfmpegTranscoder, MediaPipeline, MissingAudioTranscoder, PreparedMedia,
};
pub use session::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, ReconnectPolicy, SessionManager,
    SessionOptions, SessionState,
};

/// A running bridge: one session, one ingestion task draining its events,
/// and the command surface sharing both.
pub struct Bridge {
    storage: Storage,
    session: Arc<SessionManager>,
    ingestion: Arc<IngestionPipeline>,
    commands: Arc<CommandApi>,
    shutdown: watch::Sender<bool>,
    ingest_task: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Wires the components together and starts ingestion. The session is
    /// not connected yet; call [`Bridge::connect`].
    pub async fn start(
        storage: Storage,
        session: Arc<SessionManager>,
        transcoder: Arc<dyn AudioTranscoder>,
        media_dir: impl Into<PathBuf>,
    ) -> Result<Arc<Self>> {
        let events = session
            .take_events()
            .await
            .ok_or_else(|| anyhow!("session event queue already has a consumer"))?;
        let ingestion = IngestionPipeline::new(storage.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ingest_task = ingestion.spawn(events, shutdown_rx);

        let media = Arc::new(MediaPipeline::new(
            storage.clone(),
            Arc::clone(&session),
            transcoder,
            media_dir,
        ));
        let commands = Arc::new(CommandApi::new(
            storage.clone(),
            Arc::clone(&session),
            media,
        ));

        Ok(Arc::new(Self {
            storage,
            session,
            ingestion,
            commands,
            shutdown,
            ingest_task: Mutex::new(Some(ingest_task)),
        }))
    }

    pub async fn connect(&self) -> BridgeResult<SessionState> {
        let state = self.session.connect().await?;
        info!(state = state.label(), "session connect finished");
        Ok(state)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn ingestion(&self) -> &Arc<IngestionPipeline> {
        &self.ingestion
    }

    pub fn commands(&self) -> &Arc<CommandApi> {
        &self.commands
    }

    /// Stops ingestion first, then the session.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.ingest_task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "ingestion task ended abnormally");
            }
        }
        self.session.shutdown().await;
    }
}
