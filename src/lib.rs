pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod session;

pub use audio::{
    AudioCapture, AudioPlayback, CaptureDevice, PcmFormat, PlaybackDevice, RawPcmCapture,
    RawPcmPlayback, WavFileCapture, WavFilePlayback,
};
pub use config::Config;
pub use connection::{
    ConnectRequest, ConnectionManager, ConnectionState, Connector, Credentials, WebSocketConnector,
};
pub use error::{ConnectionError, DecodeError, DeviceError, EncodeError};
pub use protocol::{InboundEnvelope, InboundEvent, OutboundCommand, SessionSettings};
pub use session::{
    SessionConfig, SessionEvent, SessionStats, ToolHandler, ToolRegistry, VoiceSession,
};
