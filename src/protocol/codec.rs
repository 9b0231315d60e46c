//! Message codec: typed commands/events to and from JSON text frames.
//!
//! Decoding is two-phase. The `type` discriminator is read first without
//! looking at any other field, then the frame is parsed against the schema
//! for that discriminator. Discriminators this client does not know are
//! reported as [`Decoded::Skipped`], which is not an error.

use base64::Engine;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::messages::*;
use super::MAX_FRAME_BYTES;
use crate::error::{DecodeError, EncodeError};

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(InboundEnvelope),
    /// Well-formed frame with a discriminator this client does not handle
    Skipped(String),
}

/// Serialize a command into a single text frame
pub fn encode(command: &OutboundCommand) -> Result<String, EncodeError> {
    let text =
        serde_json::to_string(command).map_err(|e| EncodeError::Serialize(e.to_string()))?;

    if text.len() > MAX_FRAME_BYTES {
        return Err(EncodeError::TooLarge {
            size: text.len(),
            limit: MAX_FRAME_BYTES,
        });
    }

    Ok(text)
}

/// Parse an outbound frame back into a command
pub fn decode_command(text: &str) -> Result<OutboundCommand, DecodeError> {
    serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Decode one inbound text frame
pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingDiscriminator)?
        .to_string();

    let envelope = match kind.as_str() {
        "chat_metadata" => {
            let wire: WireChatMetadata = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::ChatMetadata {
                    chat_id: wire.chat_id,
                    chat_group_id: wire.chat_group_id,
                    request_id: wire.request_id,
                },
            )
        }
        "user_message" => {
            let wire: WireUserMessage = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::UserTranscript {
                    text: wire.message.content.unwrap_or_default(),
                    is_interim: wire.interim,
                    from_text: wire.from_text,
                    emotion_scores: wire.models.into_scores(),
                    time_range: wire.time,
                },
            )
        }
        "assistant_message" => {
            let wire: WireAssistantMessage = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::AssistantTranscript {
                    text: wire.message.content.unwrap_or_default(),
                    from_text: wire.from_text,
                    id: wire.id,
                    emotion_scores: wire.models.into_scores(),
                },
            )
        }
        "assistant_end" => {
            let wire: WireAssistantEnd = parse(&kind, value)?;
            envelope(wire.custom_session_id, InboundEvent::AssistantTurnEnd)
        }
        "assistant_prosody" => {
            let wire: WireAssistantProsody = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::AssistantProsody {
                    id: wire.id,
                    emotion_scores: wire.models.into_scores(),
                },
            )
        }
        "audio_output" => {
            let wire: WireAudioOutput = parse(&kind, value)?;
            let data = base64::engine::general_purpose::STANDARD
                .decode(wire.data.as_bytes())
                .map_err(|e| DecodeError::Audio(e.to_string()))?;
            envelope(
                wire.custom_session_id,
                InboundEvent::AudioChunk {
                    data: Bytes::from(data),
                    id: wire.id,
                    sequence_index: wire.index,
                },
            )
        }
        "user_interruption" => {
            let wire: WireUserInterruption = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::UserInterruption {
                    timestamp_ms: wire.time,
                },
            )
        }
        "tool_call" => {
            let wire: WireToolCall = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::ToolInvocationRequest {
                    call_id: wire.tool_call_id,
                    tool_name: wire.name,
                    parameters_json: wire.parameters,
                    response_required: wire.response_required,
                    tool_kind: wire.tool_type,
                },
            )
        }
        "tool_response" => {
            let wire: WireToolResponse = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::ToolInvocationResult {
                    call_id: wire.tool_call_id,
                    content: wire.content,
                },
            )
        }
        "tool_error" => {
            let wire: WireToolError = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::ToolInvocationError {
                    call_id: wire.tool_call_id,
                    error: wire.error,
                    content: wire.content,
                    severity: wire.level,
                },
            )
        }
        "error" => {
            let wire: WireError = parse(&kind, value)?;
            envelope(
                wire.custom_session_id,
                InboundEvent::ProtocolError {
                    message: wire.message,
                    code: wire.code,
                },
            )
        }
        _ => return Ok(Decoded::Skipped(kind)),
    };

    Ok(Decoded::Event(envelope))
}

fn parse<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Schema {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

fn envelope(custom_session_id: Option<String>, event: InboundEvent) -> InboundEnvelope {
    InboundEnvelope {
        custom_session_id,
        event,
    }
}
