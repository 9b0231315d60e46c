use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::audio::{CaptureOptions, PcmFormat, PlaybackOptions};
use crate::protocol::{AudioFormat, SessionContext, SessionSettings, ToolSpec};

/// Configuration for a voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identifier used in logs (e.g., "evi-4f1c...")
    pub session_id: String,

    /// Keep forwarding microphone audio while the assistant speaks
    pub allow_user_interrupt: bool,

    /// Run bring-up after this long even if the connection never reported open
    pub bring_up_fallback: Duration,

    /// Events replayed to a subscriber that joins late
    pub event_replay: usize,

    /// Events a subscriber may fall behind by before it starts skipping
    pub event_capacity: usize,

    /// Discard queued assistant audio when the user interrupts
    pub flush_playback_on_interrupt: bool,

    /// Capture sample rate sent upstream (16kHz mono by default)
    pub capture_sample_rate: u32,
    pub capture_channels: u16,

    /// Bytes per captured chunk. 3200 is 100ms at 16kHz mono.
    pub capture_chunk_bytes: usize,

    /// Playback device rate until the first container header says otherwise
    pub playback_sample_rate: u32,
    pub playback_queue_capacity: usize,

    pub system_prompt: Option<String>,
    pub context: Option<SessionContext>,
    pub voice_id: Option<String>,
    /// Echoed back on every inbound frame
    pub custom_session_id: Option<String>,
    pub variables: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: format!("evi-{}", uuid::Uuid::new_v4()),
            allow_user_interrupt: false,
            bring_up_fallback: Duration::from_millis(1500),
            event_replay: 32,
            event_capacity: 1024,
            flush_playback_on_interrupt: true,
            capture_sample_rate: 16000,
            capture_channels: 1,
            capture_chunk_bytes: 3200,
            playback_sample_rate: 48000,
            playback_queue_capacity: 64,
            system_prompt: None,
            context: None,
            voice_id: None,
            custom_session_id: None,
            variables: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            format: PcmFormat {
                sample_rate: self.capture_sample_rate,
                channels: self.capture_channels,
                bits_per_sample: 16,
            },
            chunk_bytes: self.capture_chunk_bytes,
            ..CaptureOptions::default()
        }
    }

    pub fn playback_options(&self) -> PlaybackOptions {
        PlaybackOptions {
            format: PcmFormat::mono16(self.playback_sample_rate),
            capacity: self.playback_queue_capacity,
            ..PlaybackOptions::default()
        }
    }

    /// Session settings announcing the capture format and the given tools
    pub fn settings(&self, tools: Vec<ToolSpec>) -> SessionSettings {
        let mut settings = SessionSettings::new(AudioFormat::linear16(
            self.capture_sample_rate,
            self.capture_channels,
        ));
        settings.tools = (!tools.is_empty()).then_some(tools);
        settings.system_prompt = self.system_prompt.clone();
        settings.context = self.context.clone();
        settings.voice_id = self.voice_id.clone();
        settings.custom_session_id = self.custom_session_id.clone();
        settings.variables = (!self.variables.is_empty()).then(|| self.variables.clone());
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AudioEncoding, ContextKind};

    #[test]
    fn test_default_settings_only_carry_audio() {
        let settings = SessionConfig::default().settings(Vec::new());
        assert_eq!(settings.audio.encoding, AudioEncoding::Linear16);
        assert_eq!(settings.audio.sample_rate, 16000);
        assert_eq!(settings.audio.channels, 1);
        assert!(settings.tools.is_none());
        assert!(settings.variables.is_none());
    }

    #[test]
    fn test_settings_copy_prompt_and_context() {
        let config = SessionConfig {
            system_prompt: Some("Be brief.".to_string()),
            context: Some(SessionContext {
                text: "User is driving".to_string(),
                kind: ContextKind::Persistent,
            }),
            variables: BTreeMap::from([("name".to_string(), "Ada".to_string())]),
            ..SessionConfig::default()
        };

        let settings = config.settings(Vec::new());
        assert_eq!(settings.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(settings.context.unwrap().kind, ContextKind::Persistent);
        assert_eq!(settings.variables.unwrap()["name"], "Ada");
    }
}
