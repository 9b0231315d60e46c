//! Voice session coordination
//!
//! - `session`: the coordinator tying connection, audio loops and events together
//! - `turn`: turn-taking policy deciding whether captured audio goes upstream
//! - `events`: fan-out of connection transitions and inbound events
//! - `tools`: client-side tool handlers the assistant can call
//! - `stats`: session statistics snapshot

mod config;
mod events;
mod session;
mod stats;
mod tools;
mod turn;

pub use config::SessionConfig;
pub use events::{AudioDirection, EventBus, EventSubscription, SessionEvent};
pub use session::{VoiceSession, VoiceSessionBuilder};
pub use stats::SessionStats;
pub use tools::{ToolFailure, ToolHandler, ToolRegistry, DEFAULT_TOOL_TIMEOUT};
pub use turn::{TurnState, TurnTaking};
