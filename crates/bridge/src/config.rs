use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context;
use bridge_core::{ReconnectPolicy, SessionOptions};
use tracing::warn;

pub const CONFIG_FILE: &str = "bridge.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Gateway,
    /// In-process transport; useful for demos and local testing.
    Loopback,
    /// No protocol session at all; only stored history is served.
    None,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gateway" => Ok(Self::Gateway),
            "loopback" => Ok(Self::Loopback),
            "none" => Ok(Self::None),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind: String,
    pub database_url: String,
    pub media_dir: PathBuf,
    pub credentials_path: PathBuf,
    pub transport: TransportKind,
    pub gateway_url: String,
    pub event_capacity: usize,
    pub send_timeout_secs: u64,
    pub media_timeout_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub ffmpeg_program: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            database_url: "sqlite://./store/messages.db".into(),
            media_dir: "./store/media".into(),
            credentials_path: "./store/session.bin".into(),
            transport: TransportKind::Gateway,
            gateway_url: "http://127.0.0.1:8090".into(),
            event_capacity: 1024,
            send_timeout_secs: 30,
            media_timeout_secs: 120,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 60_000,
            reconnect_max_attempts: 8,
            ffmpeg_program: "ffmpeg".into(),
        }
    }
}

impl Settings {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            media_timeout: Duration::from_secs(self.media_timeout_secs),
            event_capacity: self.event_capacity,
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                max_delay: Duration::from_millis(self.reconnect_max_ms),
                max_attempts: self.reconnect_max_attempts,
            },
        }
    }
}

pub fn load_settings() -> Settings {
    let file_cfg = fs::read_to_string(CONFIG_FILE)
        .ok()
        .and_then(|raw| match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                warn!(%error, file = CONFIG_FILE, "ignoring unreadable config file");
                None
            }
        })
        .unwrap_or_default();
    settings_from(&file_cfg, |key| std::env::var(key).ok())
}

/// Layers file values over the defaults, then `BRIDGE_<KEY>` and finally
/// `APP__<KEY>` from `env`.
pub fn settings_from(
    file_cfg: &HashMap<String, String>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let lookup = |key: &str| -> Option<String> {
        let upper = key.to_ascii_uppercase();
        env(&format!("APP__{upper}"))
            .or_else(|| env(&format!("BRIDGE_{upper}")))
            .or_else(|| file_cfg.get(key).cloned())
    };

    let mut settings = Settings::default();
    if let Some(v) = lookup("bind") {
        settings.bind = v;
    }
    if let Some(v) = lookup("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("media_dir") {
        settings.media_dir = v.into();
    }
    if let Some(v) = lookup("credentials_path") {
        settings.credentials_path = v.into();
    }
    if let Some(v) = lookup("gateway_url") {
        settings.gateway_url = v;
    }
    if let Some(v) = lookup("ffmpeg_program") {
        settings.ffmpeg_program = v;
    }
    parse_into(&lookup, "transport", &mut settings.transport);
    parse_into(&lookup, "event_capacity", &mut settings.event_capacity);
    parse_into(&lookup, "send_timeout_secs", &mut settings.send_timeout_secs);
    parse_into(&lookup, "media_timeout_secs", &mut settings.media_timeout_secs);
    parse_into(&lookup, "reconnect_initial_ms", &mut settings.reconnect_initial_ms);
    parse_into(&lookup, "reconnect_max_ms", &mut settings.reconnect_max_ms);
    parse_into(
        &lookup,
        "reconnect_max_attempts",
        &mut settings.reconnect_max_attempts,
    );
    settings
}

fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(error) => warn!(key, value = %raw, %error, "ignoring invalid setting"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:")
        || database_url.contains("mode=memory")
        || !database_url.starts_with("sqlite:")
    {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
