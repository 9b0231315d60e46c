use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Emotion/prosody scores keyed by dimension name, passed through untouched
pub type EmotionScores = BTreeMap<String, f64>;

// ============================================================================
// Outbound
// ============================================================================

/// Command sent to the service, one JSON object per frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundCommand {
    /// Base64 PCM captured from the microphone
    #[serde(rename = "audio_input")]
    AudioFrame { data: String },

    #[serde(rename = "session_settings")]
    SessionConfig(SessionSettings),

    /// Text the user typed instead of speaking
    #[serde(rename = "user_input")]
    TextInput { text: String },

    /// Text the assistant should speak verbatim
    #[serde(rename = "assistant_input")]
    AssistantTextInject { text: String },

    #[serde(rename = "tool_response")]
    ToolInvocationResult(ToolResponse),

    #[serde(rename = "tool_error")]
    ToolInvocationError(ToolError),

    #[serde(rename = "pause_assistant_message")]
    PauseTurns,

    #[serde(rename = "resume_assistant_message")]
    ResumeTurns,
}

impl OutboundCommand {
    /// Wrap raw PCM bytes as an `audio_input` frame
    pub fn audio(pcm: &[u8]) -> Self {
        OutboundCommand::AudioFrame {
            data: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }

    /// Wire discriminator for this command
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundCommand::AudioFrame { .. } => "audio_input",
            OutboundCommand::SessionConfig(_) => "session_settings",
            OutboundCommand::TextInput { .. } => "user_input",
            OutboundCommand::AssistantTextInject { .. } => "assistant_input",
            OutboundCommand::ToolInvocationResult(_) => "tool_response",
            OutboundCommand::ToolInvocationError(_) => "tool_error",
            OutboundCommand::PauseTurns => "pause_assistant_message",
            OutboundCommand::ResumeTurns => "resume_assistant_message",
        }
    }
}

/// Session configuration sent once per session before any audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub audio: AudioFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin_tools: Option<Vec<BuiltinTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<SessionContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_session_id: Option<String>,
}

impl SessionSettings {
    pub fn new(audio: AudioFormat) -> Self {
        Self {
            audio,
            tools: None,
            builtin_tools: None,
            context: None,
            system_prompt: None,
            variables: None,
            metadata: None,
            voice_id: None,
            custom_session_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM
    Linear16,
}

/// Format of the audio the client sends upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn linear16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sample_rate,
            channels,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Function,
    Builtin,
}

/// Client-side tool the assistant may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub name: String,
    /// JSON schema of the parameters, as a string
    pub parameters: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_content: Option<String>,
}

/// Service-side tool enabled by name (e.g. web search)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltinTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Persistent,
    Temporary,
    Editable,
}

/// Extra context injected into the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: ContextKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<ToolKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLevel {
    #[default]
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub tool_call_id: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub level: ErrorLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ToolError {
    pub fn new(tool_call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            error: error.into(),
            content: None,
            level: ErrorLevel::Warn,
            code: None,
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Start/end offsets of a user utterance, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: u64,
    pub end: u64,
}

/// Event received from the service
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ChatMetadata {
        chat_id: String,
        chat_group_id: String,
        request_id: Option<String>,
    },
    UserTranscript {
        text: String,
        is_interim: bool,
        from_text: bool,
        emotion_scores: Option<EmotionScores>,
        time_range: Option<TimeRange>,
    },
    AssistantTranscript {
        text: String,
        from_text: bool,
        id: Option<String>,
        emotion_scores: Option<EmotionScores>,
    },
    AssistantTurnEnd,
    AssistantProsody {
        id: Option<String>,
        emotion_scores: Option<EmotionScores>,
    },
    /// One self-contained unit of synthesized audio (decoded from base64)
    AudioChunk {
        data: Bytes,
        id: String,
        sequence_index: u32,
    },
    UserInterruption {
        timestamp_ms: u64,
    },
    ToolInvocationRequest {
        call_id: String,
        tool_name: String,
        parameters_json: String,
        response_required: bool,
        tool_kind: Option<ToolKind>,
    },
    ToolInvocationResult {
        call_id: String,
        content: String,
    },
    ToolInvocationError {
        call_id: String,
        error: String,
        content: Option<String>,
        severity: ErrorLevel,
    },
    ProtocolError {
        message: String,
        code: Option<String>,
    },
}

impl InboundEvent {
    /// Wire discriminator this event was decoded from
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::ChatMetadata { .. } => "chat_metadata",
            InboundEvent::UserTranscript { .. } => "user_message",
            InboundEvent::AssistantTranscript { .. } => "assistant_message",
            InboundEvent::AssistantTurnEnd => "assistant_end",
            InboundEvent::AssistantProsody { .. } => "assistant_prosody",
            InboundEvent::AudioChunk { .. } => "audio_output",
            InboundEvent::UserInterruption { .. } => "user_interruption",
            InboundEvent::ToolInvocationRequest { .. } => "tool_call",
            InboundEvent::ToolInvocationResult { .. } => "tool_response",
            InboundEvent::ToolInvocationError { .. } => "tool_error",
            InboundEvent::ProtocolError { .. } => "error",
        }
    }
}

/// Inbound event plus the multiplexing id the service echoes back
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub custom_session_id: Option<String>,
    pub event: InboundEvent,
}

// Wire shapes of inbound frames. Unknown fields are ignored.

#[derive(Debug, Deserialize)]
pub(crate) struct WireChatMetadata {
    pub chat_id: String,
    pub chat_group_id: String,
    pub request_id: Option<String>,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireChatMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireProsody {
    #[serde(default)]
    pub scores: EmotionScores,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireInference {
    pub prosody: Option<WireProsody>,
}

impl WireInference {
    pub fn into_scores(self) -> Option<EmotionScores> {
        self.prosody.map(|p| p.scores)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUserMessage {
    #[serde(default)]
    pub message: WireChatMessage,
    #[serde(default)]
    pub models: WireInference,
    #[serde(default)]
    pub from_text: bool,
    #[serde(default)]
    pub interim: bool,
    pub time: Option<TimeRange>,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAssistantMessage {
    pub id: Option<String>,
    #[serde(default)]
    pub message: WireChatMessage,
    #[serde(default)]
    pub models: WireInference,
    #[serde(default)]
    pub from_text: bool,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAssistantEnd {
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAssistantProsody {
    pub id: Option<String>,
    #[serde(default)]
    pub models: WireInference,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireAudioOutput {
    pub id: String,
    pub index: u32,
    pub data: String,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireUserInterruption {
    #[serde(default)]
    pub time: u64,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolCall {
    pub tool_call_id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: String,
    #[serde(default)]
    pub response_required: bool,
    pub tool_type: Option<ToolKind>,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolResponse {
    pub tool_call_id: String,
    #[serde(default)]
    pub content: String,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireToolError {
    pub tool_call_id: String,
    pub error: String,
    pub content: Option<String>,
    #[serde(default)]
    pub level: ErrorLevel,
    pub custom_session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireError {
    pub message: String,
    pub code: Option<String>,
    pub custom_session_id: Option<String>,
}
