use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use shared::{
    domain::{ChatId, ContentKind, MessageId},
    protocol::MediaDescriptor,
};
use storage::Storage;

use crate::{
    error::{BridgeError, BridgeResult},
    session::SessionManager,
};

pub const MEDIA_KEY_LEN: usize = 32;
const MEDIA_KEY_INFO: &[u8] = b"bridge-media/v1";
const CIPHER_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const VOICE_NOTE_MIME: &str = "audio/ogg; codecs=opus";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaCryptoError {
    #[error("media key must be {MEDIA_KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("media key expansion failed")]
    KeyDerivation,
    #[error("media encryption failed")]
    Encrypt,
    #[error("media ciphertext failed authentication")]
    Decrypt,
}

pub struct EncryptedMedia {
    pub ciphertext: Vec<u8>,
    pub media_key: Zeroizing<[u8; MEDIA_KEY_LEN]>,
    pub file_sha256: [u8; 32],
    pub file_enc_sha256: [u8; 32],
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn media_cipher(media_key: &[u8]) -> Result<(ChaCha20Poly1305, [u8; NONCE_LEN]), MediaCryptoError> {
    if media_key.len() != MEDIA_KEY_LEN {
        return Err(MediaCryptoError::InvalidKeyLength(media_key.len()));
    }
    let hk = Hkdf::<Sha256>::new(None, media_key);
    let mut okm = [0u8; CIPHER_KEY_LEN + NONCE_LEN];
    hk.expand(MEDIA_KEY_INFO, &mut okm)
        .map_err(|_| MediaCryptoError::KeyDerivation)?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm[..CIPHER_KEY_LEN]));
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&okm[CIPHER_KEY_LEN..]);
    okm.zeroize();
    Ok((cipher, nonce))
}

/// Encrypts a blob under a fresh random media key. The cipher key and nonce
/// are both expanded from that key, so each key must encrypt one blob only.
pub fn encrypt_media(plaintext: &[u8]) -> Result<EncryptedMedia, MediaCryptoError> {
    let mut generated = ChaCha20Poly1305::generate_key(&mut OsRng);
    let mut media_key = Zeroizing::new([0u8; MEDIA_KEY_LEN]);
    media_key.copy_from_slice(generated.as_slice());
    generated.as_mut_slice().zeroize();

    let (cipher, mut nonce) = media_cipher(media_key.as_slice())?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| MediaCryptoError::Encrypt)?;
    nonce.zeroize();

    Ok(EncryptedMedia {
        file_sha256: sha256(plaintext),
        file_enc_sha256: sha256(&ciphertext),
        ciphertext,
        media_key,
    })
}

pub fn decrypt_media(media_key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, MediaCryptoError> {
    let (cipher, mut nonce) = media_cipher(media_key)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| MediaCryptoError::Decrypt);
    nonce.zeroize();
    plaintext
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscodeError {
    #[error("audio converter is not installed")]
    Unavailable,
    #[error("audio conversion failed: {0}")]
    Failed(String),
}

/// Re-encodes arbitrary audio into an Ogg/Opus voice note.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn to_voice_note(&self, input: &Path, output_dir: &Path)
        -> Result<PathBuf, TranscodeError>;
}

pub struct MissingAudioTranscoder;

#[async_trait]
impl AudioTranscoder for MissingAudioTranscoder {
    async fn to_voice_note(
        &self,
        _input: &Path,
        _output_dir: &Path,
    ) -> Result<PathBuf, TranscodeError> {
        Err(TranscodeError::Unavailable)
    }
}

pub struct FfmpegTranscoder {
    program: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn to_voice_note(
        &self,
        input: &Path,
        output_dir: &Path,
    ) -> Result<PathBuf, TranscodeError> {
        let output = output_dir.join(format!("{}.ogg", Uuid::new_v4()));
        let result = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args([
                "-vn",
                "-c:a",
                "libopus",
                "-b:a",
                "32k",
                "-ar",
                "24000",
                "-ac",
                "1",
                "-application",
                "voip",
            ])
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let finished = match result {
            Ok(finished) => finished,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(TranscodeError::Unavailable),
            Err(err) => return Err(TranscodeError::Failed(err.to_string())),
        };
        if !finished.status.success() {
            let _ = tokio::fs::remove_file(&output).await;
            let stderr = String::from_utf8_lossy(&finished.stderr);
            let tail = stderr.lines().last().unwrap_or_default().trim().to_string();
            return Err(TranscodeError::Failed(format!("{}: {tail}", finished.status)));
        }
        Ok(output)
    }
}

const MIME_BY_EXTENSION: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("3gp", "video/3gpp"),
    ("ogg", "audio/ogg"),
    ("opus", "audio/opus"),
    ("mp3", "audio/mpeg"),
    ("m4a", "audio/mp4"),
    ("aac", "audio/aac"),
    ("wav", "audio/wav"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("zip", "application/zip"),
];

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|ext| !ext.is_empty())
}

pub fn mime_for_path(path: &Path) -> &'static str {
    extension_of(path)
        .and_then(|ext| {
            MIME_BY_EXTENSION
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, mime)| *mime)
        })
        .unwrap_or("application/octet-stream")
}

/// Content kind implied by a file's extension; unknown types are documents.
pub fn kind_for_path(path: &Path) -> ContentKind {
    ContentKind::from_mime(mime_for_path(path))
}

fn extension_for(descriptor: &MediaDescriptor) -> String {
    if let Some(ext) = descriptor
        .file_name
        .as_deref()
        .and_then(|name| extension_of(Path::new(name)))
    {
        return ext;
    }
    let essence = descriptor
        .mime_type
        .as_deref()
        .and_then(|mime| mime.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    MIME_BY_EXTENSION
        .iter()
        .find(|(_, mime)| *mime == essence)
        .map(|(ext, _)| ext.to_string())
        .unwrap_or_else(|| "bin".to_string())
}

fn is_voice_note_container(path: &Path) -> bool {
    matches!(extension_of(path).as_deref(), Some("ogg" | "opus"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMedia {
    pub kind: ContentKind,
    pub descriptor: MediaDescriptor,
    pub local_path: PathBuf,
    pub voice_note: bool,
}

type MediaKey = (ChatId, MessageId);

/// Downloads, decrypts and caches inbound media; encrypts and uploads
/// outbound files.
pub struct MediaPipeline {
    storage: Storage,
    session: Arc<SessionManager>,
    transcoder: Arc<dyn AudioTranscoder>,
    media_dir: PathBuf,
    in_flight: Mutex<HashMap<MediaKey, Arc<Mutex<()>>>>,
}

impl MediaPipeline {
    pub fn new(
        storage: Storage,
        session: Arc<SessionManager>,
        transcoder: Arc<dyn AudioTranscoder>,
        media_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            session,
            transcoder,
            media_dir: media_dir.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Returns the local path of a message's media, downloading it at most
    /// once. Concurrent calls for the same message wait for the first.
    pub async fn resolve(&self, chat_id: &ChatId, message_id: &MessageId) -> BridgeResult<PathBuf> {
        let key = (chat_id.clone(), message_id.clone());
        let lock = Arc::clone(self.in_flight.lock().await.entry(key.clone()).or_default());
        let result = {
            let _guard = lock.lock().await;
            self.resolve_exclusive(chat_id, message_id).await
        };

        let mut in_flight = self.in_flight.lock().await;
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(&key);
        }
        result
    }

    async fn resolve_exclusive(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
    ) -> BridgeResult<PathBuf> {
        let Some(stored) = self.storage.media_ref(chat_id, message_id).await? else {
            return Err(match self.storage.message(chat_id, message_id).await? {
                Some(_) => BridgeError::NoMedia(message_id.clone()),
                None => BridgeError::MessageNotFound {
                    chat_id: chat_id.clone(),
                    message_id: message_id.clone(),
                },
            });
        };

        if let Some(path) = &stored.local_path {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                debug!(chat_id = %chat_id, message_id = %message_id, "media cache hit");
                return Ok(path.clone());
            }
        }

        let plaintext = self.fetch_plaintext(&stored.descriptor).await?;
        let path = self
            .persist(&plaintext, &extension_for(&stored.descriptor))
            .await
            .map_err(|err| BridgeError::MediaFetchFailed(format!("{err:#}")))?;
        self.storage
            .set_media_local_path(chat_id, message_id, &path)
            .await?;
        info!(
            chat_id = %chat_id,
            message_id = %message_id,
            path = %path.display(),
            "media downloaded"
        );
        Ok(path)
    }

    async fn fetch_plaintext(&self, descriptor: &MediaDescriptor) -> BridgeResult<Vec<u8>> {
        let encrypted = self.session.fetch_media(descriptor).await?;
        verify_digest(
            "encrypted",
            descriptor.file_enc_sha256_b64.as_deref(),
            &encrypted,
        )?;

        let mut media_key = STANDARD
            .decode(descriptor.media_key_b64.as_bytes())
            .map_err(|err| BridgeError::MediaFetchFailed(format!("undecodable media key: {err}")))?;
        let plaintext = decrypt_media(&media_key, &encrypted);
        media_key.zeroize();
        let plaintext = plaintext.map_err(|err| BridgeError::MediaFetchFailed(err.to_string()))?;

        verify_digest("plaintext", descriptor.file_sha256_b64.as_deref(), &plaintext)?;
        Ok(plaintext)
    }

    /// Writes bytes to a content-addressed file, renaming a temp file into
    /// place so readers never observe a partial blob.
    async fn persist(&self, bytes: &[u8], extension: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .with_context(|| format!("failed to create {}", self.media_dir.display()))?;
        let digest = URL_SAFE_NO_PAD.encode(sha256(bytes));
        let path = self.media_dir.join(format!("{digest}.{extension}"));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        let temp = self.media_dir.join(format!(".{}.part", Uuid::new_v4()));
        tokio::fs::write(&temp, bytes)
            .await
            .with_context(|| format!("failed to write {}", temp.display()))?;
        if let Err(err) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err).with_context(|| format!("failed to move media to {}", path.display()));
        }
        Ok(path)
    }

    /// Encrypts and uploads a local file. Kind defaults to the one implied by
    /// the file extension.
    pub async fn prepare_upload(
        &self,
        path: &Path,
        kind: Option<ContentKind>,
    ) -> BridgeResult<PreparedMedia> {
        let kind = kind.unwrap_or_else(|| kind_for_path(path));
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string());
        self.upload(path, file_name, mime_for_path(path), kind, false)
            .await
    }

    /// Uploads audio as a voice note, transcoding when needed. When no
    /// converter is usable the raw file goes out as a document instead.
    pub async fn prepare_audio(&self, path: &Path) -> BridgeResult<PreparedMedia> {
        if is_voice_note_container(path) {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string());
            return self
                .upload(path, file_name, VOICE_NOTE_MIME, ContentKind::Audio, true)
                .await;
        }
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(BridgeError::Validation(format!(
                "file not found: {}",
                path.display()
            )));
        }

        let scratch = self.media_dir.join("transcode");
        tokio::fs::create_dir_all(&scratch)
            .await
            .with_context(|| format!("failed to create {}", scratch.display()))?;
        match self.transcoder.to_voice_note(path, &scratch).await {
            Ok(converted) => {
                let file_name = path
                    .file_stem()
                    .map(|stem| format!("{}.ogg", stem.to_string_lossy()));
                let uploaded = self
                    .upload(&converted, file_name, VOICE_NOTE_MIME, ContentKind::Audio, true)
                    .await;
                if let Err(err) = tokio::fs::remove_file(&converted).await {
                    debug!(error = %err, "failed to remove transcoded audio");
                }
                uploaded
            }
            Err(err) => {
                let degraded = BridgeError::MediaEncodeUnavailable(err.to_string());
                warn!(
                    path = %path.display(),
                    error = %degraded,
                    "sending audio as a document"
                );
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string());
                self.upload(path, file_name, mime_for_path(path), ContentKind::Document, false)
                    .await
            }
        }
    }

    async fn upload(
        &self,
        source: &Path,
        file_name: Option<String>,
        mime_type: &str,
        kind: ContentKind,
        voice_note: bool,
    ) -> BridgeResult<PreparedMedia> {
        let plaintext = tokio::fs::read(source).await.map_err(|err| {
            BridgeError::Validation(format!("cannot read {}: {err}", source.display()))
        })?;
        if plaintext.is_empty() {
            return Err(BridgeError::Validation(format!(
                "{} is empty",
                source.display()
            )));
        }

        let encrypted = encrypt_media(&plaintext)
            .map_err(|err| BridgeError::Validation(format!("cannot encrypt media: {err}")))?;
        let uploaded = self
            .session
            .upload_media(kind, encrypted.ciphertext.clone())
            .await?;

        let extension = extension_of(source).unwrap_or_else(|| "bin".to_string());
        let local_path = self.persist(&plaintext, &extension).await?;
        let descriptor = MediaDescriptor {
            url: uploaded.url,
            direct_path: uploaded.direct_path,
            media_key_b64: STANDARD.encode(encrypted.media_key.as_slice()),
            file_sha256_b64: Some(STANDARD.encode(encrypted.file_sha256)),
            file_enc_sha256_b64: Some(STANDARD.encode(encrypted.file_enc_sha256)),
            mime_type: Some(mime_type.to_string()),
            file_name,
            file_length: Some(plaintext.len() as u64),
        };
        Ok(PreparedMedia {
            kind,
            descriptor,
            local_path,
            voice_note,
        })
    }
}

fn verify_digest(label: &str, expected_b64: Option<&str>, bytes: &[u8]) -> BridgeResult<()> {
    let Some(expected) = expected_b64 else {
        return Ok(());
    };
    if STANDARD.encode(sha256(bytes)) == expected {
        Ok(())
    } else {
        Err(BridgeError::MediaFetchFailed(format!(
            "{label} media hash mismatch"
        )))
    }
}

#[cfg(test)]
#[path = "tests/media_tests.rs"]
mod tests;
