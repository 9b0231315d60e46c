use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::endpoint::ConnectRequest;
use super::state::{ConnectionState, StateCell};
use super::transport::{Connector, LinkCommand, LinkEvent};
use crate::error::ConnectionError;
use crate::protocol::{self, OutboundCommand, MAX_FRAME_BYTES};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Timeouts and buffer sizes for the connection manager
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Upper bound on the handshake. There is no read timeout: a session may idle indefinitely.
    pub connect_timeout: Duration,
    /// Upper bound on handing one frame to the socket writer
    pub write_timeout: Duration,
    /// Inbound frames buffered ahead of the dispatcher
    pub inbound_capacity: usize,
    /// How long the socket tasks get to finish the close handshake
    pub close_grace: Duration,
    /// State transitions retained for lagging observers
    pub state_history: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            inbound_capacity: 256,
            close_grace: Duration::from_millis(500),
            state_history: 32,
        }
    }
}

struct ActiveLink {
    generation: u64,
    commands: mpsc::Sender<LinkCommand>,
    pump: JoinHandle<()>,
    io_tasks: Vec<JoinHandle<()>>,
}

/// Owns the persistent connection to the service.
///
/// The link's lifecycle callbacks are consumed by a single pump task, which
/// is the only place (besides `close`) that moves the connection state.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    state: Arc<StateCell>,
    link: Mutex<Option<ActiveLink>>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    rejected_sends: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Self {
        let state = Arc::new(StateCell::new(options.state_history));

        Self {
            connector,
            options,
            state,
            link: Mutex::new(None),
            inbound: Mutex::new(None),
            rejected_sends: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the connection. Never fails loudly: a failure moves the state to
    /// `Failed(reason)` and returns false.
    pub async fn connect(&self, request: &ConnectRequest) -> bool {
        let Some(generation) = self.state.begin_connect() else {
            warn!(
                "Connect ignored: {} (state is {})",
                ConnectionError::AlreadyActive,
                self.state.get()
            );
            return false;
        };

        info!(
            "Connecting via {} to {} (attempt {})",
            self.connector.name(),
            request.redacted_url(),
            generation
        );

        let timeout_ms = self.options.connect_timeout.as_millis() as u64;
        let result =
            match tokio::time::timeout(self.options.connect_timeout, self.connector.connect(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(timeout_ms)),
            };

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                warn!("Connection failed: {}", e);
                self.state
                    .transition(generation, ConnectionState::Failed(e.to_string()));
                return false;
            }
        };

        // close() may have run while the handshake was in flight
        if self.state.generation() != generation || !self.state.get().is_live() {
            info!("Connection closed during handshake, discarding link");
            let _ = link.commands.try_send(LinkCommand::Close {
                code: CLOSE_NORMAL,
                reason: "closed during connect".to_string(),
            });
            abort_after(link.tasks, self.options.close_grace);
            return false;
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.options.inbound_capacity.max(1));
        *lock(&self.inbound) = Some(inbound_rx);

        let pump = tokio::spawn(pump_events(
            Arc::clone(&self.state),
            generation,
            link.events,
            inbound_tx,
            Arc::clone(&self.rejected_sends),
        ));

        *lock(&self.link) = Some(ActiveLink {
            generation,
            commands: link.commands,
            pump,
            io_tasks: link.tasks,
        });

        true
    }

    /// Hand a text frame to the socket. Returns false (and logs) when the
    /// connection is not `Connected` or the transport refuses the frame.
    pub async fn send(&self, text: String) -> bool {
        let state = self.state.get();
        if !state.is_connected() {
            warn!("Dropping outbound frame: connection is {}", state);
            return false;
        }

        if text.len() > MAX_FRAME_BYTES {
            warn!(
                "Dropping outbound frame of {} bytes (limit {})",
                text.len(),
                MAX_FRAME_BYTES
            );
            return false;
        }

        let commands = lock(&self.link).as_ref().map(|link| link.commands.clone());
        let Some(commands) = commands else {
            warn!("Dropping outbound frame: no active link");
            return false;
        };

        match tokio::time::timeout(self.options.write_timeout, commands.send(LinkCommand::Text(text)))
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                self.rejected_sends.fetch_add(1, Ordering::Relaxed);
                warn!("Outbound frame rejected: link writer has stopped");
                false
            }
            Err(_) => {
                self.rejected_sends.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Outbound frame rejected: write timed out after {} ms",
                    self.options.write_timeout.as_millis()
                );
                false
            }
        }
    }

    /// Encode and send one command
    pub async fn send_command(&self, command: &OutboundCommand) -> bool {
        match protocol::encode(command) {
            Ok(text) => self.send(text).await,
            Err(e) => {
                warn!("Cannot encode {} frame: {}", command.kind(), e);
                false
            }
        }
    }

    /// Close the connection. Safe to call at any time and any number of
    /// times; once `Disconnected` further calls are no-ops.
    pub fn close(&self, code: u16, reason: &str) {
        let current = self.state.get();
        if matches!(current, ConnectionState::Idle | ConnectionState::Disconnected) {
            debug!("Close ignored: connection is {}", current);
            return;
        }

        let generation = self.state.generation();
        info!("Closing connection ({} {})", code, reason);
        self.state
            .transition(generation, ConnectionState::Disconnecting);

        if let Some(link) = lock(&self.link).take() {
            link.pump.abort();
            let _ = link.commands.try_send(LinkCommand::Close {
                code,
                reason: reason.to_string(),
            });
            abort_after(link.io_tasks, self.options.close_grace);
        }
        lock(&self.inbound).take();

        self.state
            .transition(generation, ConnectionState::Disconnected);
    }

    /// Treat the current link as open even though no open callback was seen.
    ///
    /// Used by the bring-up fallback timer. Returns true if the connection is
    /// `Connected` afterwards.
    pub fn confirm_open(&self) -> bool {
        let generation = {
            let link = lock(&self.link);
            match link.as_ref() {
                Some(active) => active.generation,
                None => return false,
            }
        };

        if self.state.get() == ConnectionState::Connecting {
            info!("No open callback received, assuming link is open");
            self.state
                .transition(generation, ConnectionState::Connected);
        }

        self.state.get().is_connected()
    }

    /// Inbound text frames of the current link, in wire order.
    ///
    /// Available once per successful `connect`.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<String>> {
        lock(&self.inbound).take()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.watch()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Frames that never reached the wire after being accepted: the link
    /// writer had stopped, the hand-off timed out, or the socket refused them
    pub fn rejected_sends(&self) -> u64 {
        self.rejected_sends.load(Ordering::Relaxed)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(link) = lock(&self.link).take() {
            link.pump.abort();
            for task in link.io_tasks {
                task.abort();
            }
        }
    }
}

/// Apply link lifecycle callbacks in arrival order
async fn pump_events(
    state: Arc<StateCell>,
    generation: u64,
    mut events: mpsc::Receiver<LinkEvent>,
    inbound: mpsc::Sender<String>,
    rejected_sends: Arc<AtomicU64>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Opened => {
                info!("Connection open");
                state.transition(generation, ConnectionState::Connected);
            }
            LinkEvent::Message(text) => {
                // Any inbound frame proves the link is up
                if state.get() == ConnectionState::Connecting {
                    state.transition(generation, ConnectionState::Connected);
                }
                if inbound.send(text).await.is_err() {
                    debug!("Inbound receiver dropped, discarding frame");
                }
            }
            LinkEvent::Closing { code, reason } => {
                info!("Service is closing the connection ({} {})", code, reason);
                state.transition(generation, ConnectionState::Disconnecting);
            }
            LinkEvent::Closed { code, reason } => {
                info!("Connection closed ({} {})", code, reason);
                state.transition(generation, ConnectionState::Disconnected);
                return;
            }
            LinkEvent::Failure(reason) => {
                warn!("Connection failure: {}", reason);
                let next = if state.get() == ConnectionState::Disconnecting {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Failed(reason)
                };
                state.transition(generation, next);
                return;
            }
            LinkEvent::WriteFailed(reason) => {
                rejected_sends.fetch_add(1, Ordering::Relaxed);
                warn!("Outbound frame lost: {}", reason);
            }
        }
    }

    // Link went away without a close callback
    if matches!(
        state.get(),
        ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
    ) {
        state.transition(generation, ConnectionState::Disconnected);
    }
}

fn abort_after(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    if tasks.is_empty() {
        return;
    }

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(grace).await;
                for task in tasks {
                    task.abort();
                }
            });
        }
        Err(_) => {
            for task in tasks {
                task.abort();
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
