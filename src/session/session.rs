use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::events::{AudioDirection, EventBus, EventSubscription, SessionEvent};
use super::stats::SessionStats;
use super::tools::ToolRegistry;
use super::turn::{TurnState, TurnTaking};
use crate::audio::{AudioCapture, AudioPlayback, CaptureDevice, CaptureEvent, PlaybackDevice};
use crate::connection::{
    ConnectRequest, ConnectionManager, ConnectionOptions, ConnectionState, Connector, CLOSE_NORMAL,
};
use crate::protocol::{
    self, Decoded, InboundEnvelope, InboundEvent, OutboundCommand, SessionSettings, ToolError,
    ToolKind, ToolResponse,
};

#[derive(Default)]
struct Counters {
    frames_forwarded: AtomicU64,
    frames_suppressed: AtomicU64,
    audio_chunks_received: AtomicU64,
    decode_errors: AtomicU64,
    skipped_messages: AtomicU64,
}

struct Inner {
    config: SessionConfig,
    connection: ConnectionManager,

    /// Also serializes starting and stopping both audio loops
    capture: AsyncMutex<AudioCapture>,
    capture_dropped: Arc<AtomicU64>,
    playback: AudioPlayback,
    turns: TurnTaking,
    events: EventBus,
    tools: ToolRegistry,
    counters: Counters,

    /// Set once bring-up has run for the current connect
    brought_up: AtomicBool,

    started_at: Mutex<DateTime<Utc>>,

    /// Publishes connection transitions for the coordinator's whole lifetime
    watcher: Mutex<Option<JoinHandle<()>>>,

    /// Per-connect work: dispatcher, fallback timer, capture forwarding, tool calls
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Builds a [`VoiceSession`] from its owned parts
pub struct VoiceSessionBuilder {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    connection_options: ConnectionOptions,
    capture: Box<dyn CaptureDevice>,
    playback: Box<dyn PlaybackDevice>,
    tools: ToolRegistry,
}

impl VoiceSessionBuilder {
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn build(self) -> VoiceSession {
        let config = self.config;

        info!("Creating voice session: {}", config.session_id);

        let capture = AudioCapture::new(self.capture, config.capture_options());

        let inner = Inner {
            connection: ConnectionManager::new(self.connector, self.connection_options),
            capture_dropped: capture.dropped_counter(),
            capture: AsyncMutex::new(capture),
            playback: AudioPlayback::new(self.playback, config.playback_options()),
            turns: TurnTaking::new(config.allow_user_interrupt),
            events: EventBus::new(config.event_replay, config.event_capacity),
            tools: self.tools,
            counters: Counters::default(),
            brought_up: AtomicBool::new(false),
            started_at: Mutex::new(Utc::now()),
            watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            config,
        };

        VoiceSession {
            inner: Arc::new(inner),
        }
    }
}

/// A live conversation with the voice service.
///
/// Owns the connection and both audio loops, decides per captured chunk
/// whether it goes upstream, and fans inbound events out to subscribers.
pub struct VoiceSession {
    inner: Arc<Inner>,
}

impl VoiceSession {
    pub fn builder(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackDevice>,
    ) -> VoiceSessionBuilder {
        VoiceSessionBuilder {
            config,
            connector,
            connection_options: ConnectionOptions::default(),
            capture,
            playback,
            tools: ToolRegistry::new(),
        }
    }

    /// Connect and, once the connection is up, send the session settings and
    /// start the audio loops.
    ///
    /// Returns false if the connection could not be established; the reason
    /// is published as `ConnectionState::Failed`.
    pub async fn connect(&self, request: &ConnectRequest) -> bool {
        let inner = &self.inner;

        if inner.connection.state().is_live() {
            warn!("Session {} is already connected", inner.config.session_id);
            return false;
        }

        ensure_watcher(inner);

        // The previous connection's audio may still be winding down
        stop_audio(inner).await;

        inner.turns.reset();
        inner.brought_up.store(false, Ordering::SeqCst);
        *lock(&inner.started_at) = Utc::now();

        info!(session = %inner.config.session_id, "Connecting voice session");

        if !inner.connection.connect(request).await {
            return false;
        }

        let Some(mut inbound) = inner.connection.take_inbound() else {
            warn!("Connection closed before inbound frames could be read");
            return false;
        };

        let dispatcher_inner = Arc::clone(inner);
        let dispatcher = tokio::spawn(async move {
            let mut first = true;
            while let Some(text) = inbound.recv().await {
                if first {
                    first = false;
                    // Any inbound frame proves the connection is established
                    bring_up(&dispatcher_inner).await;
                }
                dispatch(&dispatcher_inner, &text);
            }
            debug!("Inbound dispatcher stopped");
        });

        let timer_inner = Arc::clone(inner);
        let fallback = tokio::spawn(async move {
            tokio::time::sleep(timer_inner.config.bring_up_fallback).await;
            if timer_inner.brought_up.load(Ordering::SeqCst) {
                return;
            }
            if !timer_inner.connection.state().is_live() {
                return;
            }
            if timer_inner.connection.confirm_open() {
                info!(
                    "No connected signal after {} ms, starting session anyway",
                    timer_inner.config.bring_up_fallback.as_millis()
                );
                bring_up(&timer_inner).await;
            }
        });

        track(inner, dispatcher);
        track(inner, fallback);

        // The connection may already be up if the open callback beat us here
        if inner.connection.state().is_connected() {
            bring_up(inner).await;
        }

        true
    }

    /// Close the connection and release both audio devices. Idempotent.
    pub async fn disconnect(&self) {
        let inner = &self.inner;

        inner.connection.close(CLOSE_NORMAL, "client disconnect");

        for task in lock(&inner.tasks).drain(..) {
            task.abort();
        }

        stop_audio(inner).await;
    }

    /// Observe connection transitions and inbound events
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Watch the connection state directly
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.connection.subscribe_state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn forwarding_audio(&self) -> bool {
        self.inner.turns.forward_audio()
    }

    pub fn turn_state(&self) -> TurnState {
        self.inner.turns.state()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.config.session_id
    }

    /// Send a user text message in place of speech
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(OutboundCommand::TextInput { text: text.into() })
            .await
    }

    /// Have the assistant speak the given text
    pub async fn send_assistant_text(&self, text: impl Into<String>) -> bool {
        self.send(OutboundCommand::AssistantTextInject { text: text.into() })
            .await
    }

    pub async fn send_tool_response(&self, response: ToolResponse) -> bool {
        self.send(OutboundCommand::ToolInvocationResult(response))
            .await
    }

    pub async fn send_tool_error(&self, error: ToolError) -> bool {
        self.send(OutboundCommand::ToolInvocationError(error)).await
    }

    /// Stop the assistant from taking turns until resumed
    pub async fn pause_assistant(&self) -> bool {
        self.send(OutboundCommand::PauseTurns).await
    }

    pub async fn resume_assistant(&self) -> bool {
        self.send(OutboundCommand::ResumeTurns).await
    }

    /// Replace the session settings mid-session
    pub async fn update_settings(&self, settings: SessionSettings) -> bool {
        self.send(OutboundCommand::SessionConfig(settings)).await
    }

    async fn send(&self, command: OutboundCommand) -> bool {
        self.inner.connection.send_command(&command).await
    }

    /// Get current session statistics
    pub fn stats(&self) -> SessionStats {
        let inner = &self.inner;
        let started_at = *lock(&inner.started_at);

        SessionStats {
            session_id: inner.config.session_id.clone(),
            started_at,
            duration_secs: (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0,
            connection_state: inner.connection.state(),
            turn_state: inner.turns.state(),
            forwarding_audio: inner.turns.forward_audio(),
            frames_forwarded: inner.counters.frames_forwarded.load(Ordering::Relaxed),
            frames_suppressed: inner.counters.frames_suppressed.load(Ordering::Relaxed),
            capture_dropped: inner.capture_dropped.load(Ordering::Relaxed),
            audio_chunks_received: inner.counters.audio_chunks_received.load(Ordering::Relaxed),
            playback_dropped: inner.playback.dropped(),
            decode_errors: inner.counters.decode_errors.load(Ordering::Relaxed),
            skipped_messages: inner.counters.skipped_messages.load(Ordering::Relaxed),
            rejected_sends: inner.connection.rejected_sends(),
            events_published: inner.events.published(),
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        let inner = &self.inner;
        for task in lock(&inner.tasks).drain(..) {
            task.abort();
        }
        if let Some(watcher) = lock(&inner.watcher).take() {
            watcher.abort();
        }
        inner.connection.close(CLOSE_NORMAL, "session dropped");
    }
}

/// Spawn the task that republishes connection transitions, once per coordinator
fn ensure_watcher(inner: &Arc<Inner>) {
    let mut watcher = lock(&inner.watcher);
    if watcher.is_some() {
        return;
    }

    let mut transitions = inner.connection.subscribe_state();
    let watcher_inner = Arc::clone(inner);

    *watcher = Some(tokio::spawn(async move {
        loop {
            let state = match transitions.recv().await {
                Ok(state) => state,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} connection transitions", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            info!(session = %watcher_inner.config.session_id, "Connection {}", state);
            watcher_inner
                .events
                .publish(SessionEvent::Connection(state.clone()));

            match state {
                ConnectionState::Connected => bring_up(&watcher_inner).await,
                ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                    stop_audio_if_down(&watcher_inner).await
                }
                _ => {}
            }
        }
    }));
}

/// Send the session settings, then start playback and capture forwarding.
///
/// Runs at most once per connect, whichever trigger arrives first.
async fn bring_up(inner: &Arc<Inner>) {
    if inner
        .brought_up
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    if !inner.connection.state().is_connected() {
        inner.brought_up.store(false, Ordering::SeqCst);
        return;
    }

    info!(session = %inner.config.session_id, "Sending session settings");

    let settings = inner.config.settings(inner.tools.specs());
    if !inner
        .connection
        .send_command(&OutboundCommand::SessionConfig(settings))
        .await
    {
        warn!("Session settings were not sent, audio not started");
        inner.brought_up.store(false, Ordering::SeqCst);
        return;
    }

    // Holding the capture lock orders this against stopping audio
    let mut capture = inner.capture.lock().await;
    if !inner.connection.state().is_connected() {
        info!("Connection closed during bring-up, audio not started");
        return;
    }

    if let Err(e) = inner.playback.start() {
        error!("Failed to start playback: {}", e);
        inner.events.publish(SessionEvent::DeviceFailed {
            direction: AudioDirection::Playback,
            message: e.to_string(),
        });
    }

    match capture.start() {
        Ok(rx) => {
            let forward = tokio::spawn(forward_capture(Arc::clone(inner), rx));
            track(inner, forward);
            info!(session = %inner.config.session_id, "Session started");
        }
        Err(e) => {
            error!("Failed to start capture: {}", e);
            inner.events.publish(SessionEvent::DeviceFailed {
                direction: AudioDirection::Capture,
                message: e.to_string(),
            });
        }
    }
}

/// Send captured chunks upstream while turn-taking allows it
async fn forward_capture(inner: Arc<Inner>, mut rx: mpsc::Receiver<CaptureEvent>) {
    let counters = &inner.counters;

    while let Some(event) = rx.recv().await {
        match event {
            CaptureEvent::Audio(chunk) => {
                if !inner.turns.forward_audio() {
                    counters.frames_suppressed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                if inner
                    .connection
                    .send_command(&OutboundCommand::audio(&chunk))
                    .await
                {
                    counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            CaptureEvent::Stopped { error: None } => {
                info!("Capture input ended");
                break;
            }
            CaptureEvent::Stopped { error: Some(e) } => {
                error!("Capture stopped: {}", e);
                inner.events.publish(SessionEvent::DeviceFailed {
                    direction: AudioDirection::Capture,
                    message: e.to_string(),
                });
                break;
            }
        }
    }
}

/// Decode one inbound frame and route it
fn dispatch(inner: &Arc<Inner>, text: &str) {
    let envelope = match protocol::decode(text) {
        Ok(Decoded::Event(envelope)) => envelope,
        Ok(Decoded::Skipped(kind)) => {
            inner
                .counters
                .skipped_messages
                .fetch_add(1, Ordering::Relaxed);
            debug!("Skipping unknown inbound frame type: {}", kind);
            return;
        }
        Err(e) => {
            inner.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            warn!("Dropping inbound frame: {}", e);
            return;
        }
    };

    if inner.turns.on_event(&envelope.event) {
        debug!(
            "Audio forwarding {}",
            if inner.turns.forward_audio() { "resumed" } else { "paused" }
        );
    }

    route(inner, &envelope);
    inner.events.publish(SessionEvent::Inbound(envelope));
}

fn route(inner: &Arc<Inner>, envelope: &InboundEnvelope) {
    match &envelope.event {
        InboundEvent::AudioChunk {
            data,
            sequence_index,
            ..
        } => {
            inner
                .counters
                .audio_chunks_received
                .fetch_add(1, Ordering::Relaxed);
            debug!(index = sequence_index, bytes = data.len(), "Assistant audio");
            inner.playback.enqueue(data.clone());
        }
        InboundEvent::UserInterruption { .. } => {
            info!("User interrupted the assistant");
            if inner.config.flush_playback_on_interrupt {
                inner.playback.flush();
            }
        }
        InboundEvent::UserTranscript {
            text, is_interim, ..
        } => {
            if *is_interim {
                debug!("User (interim): {}", text);
            } else {
                info!("User: {}", text);
            }
        }
        InboundEvent::AssistantTranscript { text, .. } => info!("Assistant: {}", text),
        InboundEvent::ChatMetadata {
            chat_id,
            chat_group_id,
            ..
        } => info!(chat_id = %chat_id, chat_group_id = %chat_group_id, "Chat started"),
        InboundEvent::ToolInvocationRequest {
            call_id,
            tool_name,
            parameters_json,
            ..
        } if inner.tools.has(tool_name) => {
            let task = tokio::spawn(run_tool(
                Arc::clone(inner),
                call_id.clone(),
                tool_name.clone(),
                parameters_json.clone(),
            ));
            track(inner, task);
        }
        InboundEvent::ToolInvocationRequest {
            call_id, tool_name, ..
        } => debug!(call_id = %call_id, "No local handler for tool {}", tool_name),
        InboundEvent::ProtocolError { message, code } => {
            warn!("Service error {}: {}", code.as_deref().unwrap_or("-"), message)
        }
        InboundEvent::AssistantTurnEnd
        | InboundEvent::AssistantProsody { .. }
        | InboundEvent::ToolInvocationResult { .. }
        | InboundEvent::ToolInvocationError { .. } => {}
    }
}

async fn run_tool(inner: Arc<Inner>, call_id: String, tool_name: String, parameters_json: String) {
    info!(call_id = %call_id, "Running tool {}", tool_name);

    let command = match inner.tools.invoke(&tool_name, &parameters_json).await {
        Ok(content) => OutboundCommand::ToolInvocationResult(ToolResponse {
            tool_call_id: call_id,
            content,
            tool_name: Some(tool_name),
            tool_type: Some(ToolKind::Function),
        }),
        Err(e) => {
            warn!(call_id = %call_id, "Tool {} failed: {}", tool_name, e);
            let mut error = ToolError::new(call_id, e.to_string());
            error.content = Some(format!("The {} tool is unavailable right now.", tool_name));
            OutboundCommand::ToolInvocationError(error)
        }
    };

    inner.connection.send_command(&command).await;
}

/// Stop both audio loops under one lock, so a bring-up never sees playback
/// half-stopped
async fn stop_audio(inner: &Arc<Inner>) {
    let mut capture = inner.capture.lock().await;
    capture.stop().await;
    inner.playback.stop().await;
}

/// Stop audio for a connection that went down, unless a newer connect has
/// already taken over
async fn stop_audio_if_down(inner: &Arc<Inner>) {
    let mut capture = inner.capture.lock().await;
    let state = inner.connection.state();
    if state.is_live() {
        debug!("Connection is {} again, keeping audio running", state);
        return;
    }
    capture.stop().await;
    inner.playback.stop().await;
}

/// Keep a per-connect task so disconnect and drop can cancel it
fn track(inner: &Inner, task: JoinHandle<()>) {
    let mut tasks = lock(&inner.tasks);
    tasks.retain(|t| !t.is_finished());
    tasks.push(task);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
