//! Error taxonomy for the session core.
//!
//! None of these escape the audio or message path as panics: connection
//! failures become [`ConnectionState::Failed`](crate::connection::ConnectionState),
//! decode failures are logged and the frame dropped, device failures end the
//! owning loop.

use thiserror::Error;

/// Transport-level failure while connecting or talking to the service
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("connect timed out after {0} ms")]
    Timeout(u64),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection already active")]
    AlreadyActive,
}

/// Inbound text that could not be turned into an event
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame has no `type` discriminator")]
    MissingDiscriminator,

    #[error("`{kind}` frame does not match its schema: {reason}")]
    Schema { kind: String, reason: String },

    #[error("invalid base64 audio payload: {0}")]
    Audio(String),
}

/// Outbound command that cannot be put on the wire
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Audio hardware unavailable or failed mid-stream
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open audio device: {0}")]
    Open(String),

    #[error("audio device I/O failed: {0}")]
    Io(String),

    #[error("audio device reached end of stream")]
    EndOfStream,

    #[error("audio device is busy")]
    Busy,

    #[error("audio device stalled after {0} empty reads")]
    Stalled(u32),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Io(err.to_string())
    }
}

impl From<hound::Error> for DeviceError {
    fn from(err: hound::Error) -> Self {
        DeviceError::Io(err.to_string())
    }
}
