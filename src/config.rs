use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::connection::{
    ConnectRequest, ConnectionOptions, CredentialPlacement, Credentials, SessionParams,
};
use crate::protocol::{ContextKind, SessionContext};
use crate::session::SessionConfig;

/// Prefix of environment overrides, e.g. `EVI__CONNECTION__API_KEY`
pub const ENV_PREFIX: &str = "EVI";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub auth: CredentialPlacement,
    pub config_id: Option<String>,
    pub config_version: Option<u32>,
    pub resumed_chat_group_id: Option<String>,
    pub verbose_transcription: bool,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.hume.ai/v0/evi/chat".to_string(),
            api_key: None,
            access_token: None,
            auth: CredentialPlacement::Query,
            config_id: None,
            config_version: None,
            resumed_chat_group_id: None,
            verbose_transcription: false,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &redact(&self.api_key))
            .field("access_token", &redact(&self.access_token))
            .field("auth", &self.auth)
            .field("config_id", &self.config_id)
            .field("config_version", &self.config_version)
            .field("resumed_chat_group_id", &self.resumed_chat_group_id)
            .field("verbose_transcription", &self.verbose_transcription)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_channels: u16,
    pub capture_chunk_bytes: usize,
    pub playback_sample_rate: u32,
    pub playback_queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16000,
            capture_channels: 1,
            capture_chunk_bytes: 3200,
            playback_sample_rate: 48000,
            playback_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub allow_user_interrupt: bool,
    pub bring_up_fallback_ms: u64,
    pub event_replay: usize,
    pub flush_playback_on_interrupt: bool,
    pub system_prompt: Option<String>,
    /// Persistent context text injected at session start
    pub context: Option<String>,
    pub voice_id: Option<String>,
    pub custom_session_id: Option<String>,
    pub variables: BTreeMap<String, String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            allow_user_interrupt: false,
            bring_up_fallback_ms: 1500,
            event_replay: 32,
            flush_playback_on_interrupt: true,
            system_prompt: None,
            context: None,
            voice_id: None,
            custom_session_id: None,
            variables: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load `path` (any format the extension names) under environment overrides
    pub fn load(path: &str) -> Result<Self> {
        Self::build(Some(path))
    }

    /// Defaults plus environment overrides only
    pub fn from_env() -> Result<Self> {
        Self::build(None)
    }

    fn build(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| match path {
                Some(path) => format!("Failed to load config from {}", path),
                None => "Failed to load config from environment".to_string(),
            })?;

        Ok(settings.try_deserialize()?)
    }

    /// Endpoint, credential and server-side configuration for `connect`
    pub fn connect_request(&self) -> Result<ConnectRequest> {
        let conn = &self.connection;
        let credentials = match (&conn.api_key, &conn.access_token) {
            (Some(key), _) if !key.is_empty() => Credentials::ApiKey(key.clone()),
            (_, Some(token)) if !token.is_empty() => Credentials::AccessToken(token.clone()),
            _ => bail!(
                "No credential configured: set connection.api_key or {}__CONNECTION__API_KEY",
                ENV_PREFIX
            ),
        };

        let mut request = ConnectRequest::new(&conn.endpoint, credentials);
        request.placement = conn.auth;
        request.params = SessionParams {
            config_id: conn.config_id.clone(),
            config_version: conn.config_version,
            resumed_chat_group_id: conn.resumed_chat_group_id.clone(),
            verbose_transcription: conn.verbose_transcription,
        };

        // Fail early on a bad endpoint rather than at connect time
        request.url()?;
        Ok(request)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.connection.write_timeout_ms),
            ..ConnectionOptions::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let session = &self.session;
        let audio = &self.audio;

        SessionConfig {
            allow_user_interrupt: session.allow_user_interrupt,
            bring_up_fallback: Duration::from_millis(session.bring_up_fallback_ms),
            event_replay: session.event_replay,
            flush_playback_on_interrupt: session.flush_playback_on_interrupt,
            capture_sample_rate: audio.capture_sample_rate,
            capture_channels: audio.capture_channels,
            capture_chunk_bytes: audio.capture_chunk_bytes,
            playback_sample_rate: audio.playback_sample_rate,
            playback_queue_capacity: audio.playback_queue_capacity,
            system_prompt: session.system_prompt.clone(),
            context: session.context.clone().map(|text| SessionContext {
                text,
                kind: ContextKind::Persistent,
            }),
            voice_id: session.voice_id.clone(),
            custom_session_id: session.custom_session_id.clone(),
            variables: session.variables.clone(),
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> String {
        let path = dir.path().join("evi-bridge.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_load_file_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[connection]
api_key = "abc"
config_id = "cfg-1"
auth = "header"

[session]
allow_user_interrupt = true
context = "The user is in a hurry"
"#,
        );

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.audio.capture_sample_rate, 16000);
        assert_eq!(cfg.audio.playback_queue_capacity, 64);

        let request = cfg.connect_request().unwrap();
        assert_eq!(request.placement, CredentialPlacement::Header);
        assert_eq!(request.params.config_id.as_deref(), Some("cfg-1"));

        let session = cfg.session_config();
        assert!(session.allow_user_interrupt);
        assert_eq!(session.bring_up_fallback, Duration::from_millis(1500));
        assert_eq!(session.context.unwrap().kind, ContextKind::Persistent);
    }

    #[test]
    fn test_missing_credential_is_an_error() {
        let cfg = Config::default();
        assert!(cfg.connect_request().is_err());
    }

    #[test]
    fn test_debug_hides_credentials() {
        let mut cfg = Config::default();
        cfg.connection.api_key = Some("super-secret".to_string());
        let shown = format!("{:?}", cfg);
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("<redacted>"));
    }
}
