use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::debug;

/// Lifecycle of the service connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// Transport failure with a human-readable diagnostic
    Failed(String),
}

impl ConnectionState {
    /// Whether `next` is a legal successor of this state.
    ///
    /// `Disconnected` and `Failed` are only left through a fresh connect
    /// (or, for `Failed`, an explicit close), so late callbacks from a dead
    /// transport can never bring a connection back.
    pub fn permits(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connecting, Failed(_))
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Connected, Failed(_))
                | (Disconnecting, Disconnected)
                | (Disconnected, Connecting)
                | (Failed(_), Connecting)
                | (Failed(_), Disconnecting)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// `Connecting` or `Connected`
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

struct CellInner {
    state: ConnectionState,
    /// Incremented on every connect attempt; callbacks from older attempts are ignored
    generation: u64,
}

/// Single owner of the connection state.
///
/// All transitions go through one mutex, so lifecycle callbacks are applied
/// one at a time and observers see them in the order they were applied.
pub struct StateCell {
    inner: Mutex<CellInner>,
    current: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(history: usize) -> Self {
        let (current, _) = watch::channel(ConnectionState::Idle);
        let (transitions, _) = broadcast::channel(history.max(1));

        Self {
            inner: Mutex::new(CellInner {
                state: ConnectionState::Idle,
                generation: 0,
            }),
            current,
            transitions,
        }
    }

    pub fn get(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Enter `Connecting` for a new attempt, returning its generation
    pub fn begin_connect(&self) -> Option<u64> {
        let mut inner = self.lock();
        if !inner.state.permits(&ConnectionState::Connecting) {
            return None;
        }

        inner.generation += 1;
        self.apply(&mut inner, ConnectionState::Connecting);
        Some(inner.generation)
    }

    /// Apply `next` on behalf of connection attempt `generation`.
    ///
    /// Returns false when the attempt is stale or the transition is illegal.
    pub fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let mut inner = self.lock();

        if inner.generation != generation {
            debug!(
                "Ignoring {} from stale connection attempt {} (current {})",
                next, generation, inner.generation
            );
            return false;
        }

        if !inner.state.permits(&next) {
            debug!("Ignoring transition {} -> {}", inner.state, next);
            return false;
        }

        self.apply(&mut inner, next);
        true
    }

    /// Latest state, for observers that only care about the present
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.current.subscribe()
    }

    /// Every transition applied from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    fn apply(&self, inner: &mut CellInner, next: ConnectionState) {
        debug!("Connection state {} -> {}", inner.state, next);
        inner.state = next.clone();
        self.current.send_replace(next.clone());
        // No subscribers is fine
        let _ = self.transitions.send(next);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CellInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
