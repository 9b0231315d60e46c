//! Wire protocol spoken with the conversational voice service
//!
//! Every frame is a single JSON object discriminated by its `type` field:
//! - Outbound: `audio_input`, `session_settings`, `user_input`, `assistant_input`,
//!   `tool_response`, `tool_error`, `pause_assistant_message`, `resume_assistant_message`
//! - Inbound: `chat_metadata`, `user_message`, `assistant_message`, `assistant_end`,
//!   `assistant_prosody`, `audio_output`, `user_interruption`, `tool_call`,
//!   `tool_response`, `tool_error`, `error`

pub mod codec;
pub mod messages;

pub use codec::{decode, decode_command, encode, Decoded};
pub use messages::{
    AudioEncoding, AudioFormat, BuiltinTool, ContextKind, EmotionScores, ErrorLevel,
    InboundEnvelope, InboundEvent, OutboundCommand, SessionContext, SessionSettings, TimeRange,
    ToolError, ToolKind, ToolResponse, ToolSpec,
};

/// Largest frame either side may put on the wire (16 MiB)
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
