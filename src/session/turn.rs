use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::protocol::InboundEvent;

/// Who currently holds the floor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnState {
    /// The user has the floor
    Listening,
    /// Assistant audio is arriving
    Speaking { interruptible: bool },
    /// The assistant answered in text only and has not ended its turn yet
    AwaitingTurnEnd,
}

/// Turn-taking policy.
///
/// Owns the forwarding flag read by the capture path before every frame.
/// Only inbound events move it.
pub struct TurnTaking {
    allow_user_interrupt: bool,
    forward_audio: AtomicBool,
    state: Mutex<TurnState>,
}

impl TurnTaking {
    pub fn new(allow_user_interrupt: bool) -> Self {
        Self {
            allow_user_interrupt,
            forward_audio: AtomicBool::new(true),
            state: Mutex::new(TurnState::Listening),
        }
    }

    /// Whether captured audio may be sent upstream right now
    pub fn forward_audio(&self) -> bool {
        self.forward_audio.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TurnState {
        *lock(&self.state)
    }

    pub fn allow_user_interrupt(&self) -> bool {
        self.allow_user_interrupt
    }

    /// Back to the start-of-session state
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        *state = TurnState::Listening;
        self.forward_audio.store(true, Ordering::SeqCst);
    }

    /// Apply one inbound event. Returns true if the forwarding flag changed.
    pub fn on_event(&self, event: &InboundEvent) -> bool {
        let mut state = lock(&self.state);

        let (next, flag) = match event {
            InboundEvent::AudioChunk { .. } => (
                TurnState::Speaking {
                    interruptible: self.allow_user_interrupt,
                },
                Some(self.allow_user_interrupt),
            ),
            InboundEvent::AssistantTurnEnd | InboundEvent::UserInterruption { .. } => {
                (TurnState::Listening, Some(true))
            }
            InboundEvent::AssistantTranscript { .. } if *state == TurnState::Listening => {
                (TurnState::AwaitingTurnEnd, None)
            }
            _ => return false,
        };

        if *state != next {
            debug!("Turn state {:?} -> {:?}", *state, next);
            *state = next;
        }

        match flag {
            Some(value) => self.forward_audio.swap(value, Ordering::SeqCst) != value,
            None => false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn audio_chunk() -> InboundEvent {
        InboundEvent::AudioChunk {
            data: Bytes::from_static(&[0, 0]),
            id: "a1".to_string(),
            sequence_index: 0,
        }
    }

    fn interruption() -> InboundEvent {
        InboundEvent::UserInterruption { timestamp_ms: 1200 }
    }

    #[test]
    fn test_starts_forwarding() {
        let turns = TurnTaking::new(false);
        assert!(turns.forward_audio());
        assert_eq!(turns.state(), TurnState::Listening);
    }

    #[test]
    fn test_assistant_audio_mutes_until_turn_end() {
        let turns = TurnTaking::new(false);

        assert!(turns.on_event(&audio_chunk()));
        assert!(!turns.forward_audio());
        assert_eq!(
            turns.state(),
            TurnState::Speaking {
                interruptible: false
            }
        );

        // Further chunks keep it muted without a change
        assert!(!turns.on_event(&audio_chunk()));
        assert!(!turns.forward_audio());

        assert!(turns.on_event(&InboundEvent::AssistantTurnEnd));
        assert!(turns.forward_audio());
        assert_eq!(turns.state(), TurnState::Listening);
    }

    #[test]
    fn test_interruptible_assistant_keeps_forwarding() {
        let turns = TurnTaking::new(true);

        assert!(!turns.on_event(&audio_chunk()));
        assert!(turns.forward_audio());
        assert_eq!(
            turns.state(),
            TurnState::Speaking {
                interruptible: true
            }
        );
    }

    #[test]
    fn test_interruption_always_restores_forwarding() {
        // Prior state muted
        let turns = TurnTaking::new(false);
        turns.on_event(&audio_chunk());
        assert!(!turns.forward_audio());
        turns.on_event(&interruption());
        assert!(turns.forward_audio());

        // Prior state already forwarding
        let turns = TurnTaking::new(false);
        assert!(turns.forward_audio());
        assert!(!turns.on_event(&interruption()));
        assert!(turns.forward_audio());
    }

    #[test]
    fn test_text_reply_awaits_turn_end() {
        let turns = TurnTaking::new(false);
        let reply = InboundEvent::AssistantTranscript {
            text: "Hello".to_string(),
            from_text: false,
            id: None,
            emotion_scores: None,
        };

        assert!(!turns.on_event(&reply));
        assert_eq!(turns.state(), TurnState::AwaitingTurnEnd);
        assert!(turns.forward_audio());

        turns.on_event(&audio_chunk());
        // A transcript mid-speech does not change the state
        turns.on_event(&reply);
        assert_eq!(
            turns.state(),
            TurnState::Speaking {
                interruptible: false
            }
        );
    }

    #[test]
    fn test_other_events_leave_flag_alone() {
        let turns = TurnTaking::new(false);
        turns.on_event(&audio_chunk());

        let events = [
            InboundEvent::ChatMetadata {
                chat_id: "c".to_string(),
                chat_group_id: "g".to_string(),
                request_id: None,
            },
            InboundEvent::ProtocolError {
                message: "bad".to_string(),
                code: None,
            },
        ];
        for event in &events {
            assert!(!turns.on_event(event));
            assert!(!turns.forward_audio());
        }

        turns.reset();
        assert!(turns.forward_audio());
        assert_eq!(turns.state(), TurnState::Listening);
    }
}
