use chrono::{DateTime, Utc};
use serde::Serialize;

use super::turn::TurnState;
use crate::connection::ConnectionState;

/// Statistics about a voice session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,

    /// When the current (or last) connect started
    pub started_at: DateTime<Utc>,

    /// Seconds since `started_at`
    pub duration_secs: f64,

    pub connection_state: ConnectionState,

    pub turn_state: TurnState,

    /// Whether captured audio is currently forwarded upstream
    pub forwarding_audio: bool,

    /// Captured chunks sent upstream
    pub frames_forwarded: u64,

    /// Captured chunks held back by turn-taking
    pub frames_suppressed: u64,

    /// Captured chunks lost because forwarding fell behind the device
    pub capture_dropped: u64,

    /// Assistant audio units received
    pub audio_chunks_received: u64,

    /// Assistant audio units rejected by a full playback queue
    pub playback_dropped: u64,

    /// Inbound frames that failed to decode
    pub decode_errors: u64,

    /// Inbound frames of an unknown type
    pub skipped_messages: u64,

    /// Outbound frames the transport refused, at hand-off or on the socket
    pub rejected_sends: u64,

    pub events_published: u64,
}
