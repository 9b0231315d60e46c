use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::connection::ConnectionState;
use crate::protocol::InboundEnvelope;

/// Which local audio loop an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    Capture,
    Playback,
}

/// Everything a session publishes to its observers, in dispatch order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection moved to a new state
    Connection(ConnectionState),
    /// A decoded frame from the service
    Inbound(InboundEnvelope),
    /// A local audio loop stopped because its device failed
    DeviceFailed {
        direction: AudioDirection,
        message: String,
    },
}

struct Replay {
    events: VecDeque<SessionEvent>,
    capacity: usize,
}

/// Multi-subscriber event fan-out.
///
/// Keeps the most recent `replay` events so a subscriber that joins late
/// starts from them; after that it sees every event in publish order.
pub struct EventBus {
    replay: Mutex<Replay>,
    sender: broadcast::Sender<SessionEvent>,
    published: AtomicU64,
    undelivered: AtomicU64,
}

impl EventBus {
    /// `replay` bounds the latecomer history; `capacity` bounds how far a
    /// slow subscriber may fall behind before it starts losing events.
    pub fn new(replay: usize, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            replay: Mutex::new(Replay {
                events: VecDeque::with_capacity(replay),
                capacity: replay,
            }),
            sender,
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
        }
    }

    /// Publish one event. Never blocks. Returns how many live subscribers it reached.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let mut replay = lock(&self.replay);

        if replay.capacity > 0 {
            if replay.events.len() == replay.capacity {
                replay.events.pop_front();
            }
            replay.events.push_back(event.clone());
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                self.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Subscribe, starting with the retained history
    pub fn subscribe(&self) -> EventSubscription {
        // Holding the replay lock keeps history and live stream gap-free
        let replay = lock(&self.replay);
        EventSubscription {
            backlog: replay.events.clone(),
            receiver: self.sender.subscribe(),
            lagged: 0,
        }
    }

    /// Events published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events published while nobody was subscribed
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One subscriber's view of the event sequence
pub struct EventSubscription {
    backlog: VecDeque<SessionEvent>,
    receiver: broadcast::Receiver<SessionEvent>,
    lagged: u64,
}

impl EventSubscription {
    /// Next event, or `None` once the publishing session is gone.
    ///
    /// A subscriber that falls too far behind skips the overwritten events;
    /// the skip is logged and counted in `lagged`.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                    self.lagged += skipped;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                    self.lagged += skipped;
                }
                Err(_) => return None,
            }
        }
    }

    /// Events this subscriber lost by falling behind
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    pub fn into_stream(self) -> impl Stream<Item = SessionEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
