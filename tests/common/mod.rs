// Shared fixtures for session integration tests: a scripted connector that
// records every outbound frame, and in-memory audio devices.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use evi_bridge::audio::wav::{WavHeader, WAV_HEADER_LEN};
use evi_bridge::audio::{CaptureDevice, PcmFormat, PlaybackDevice};
use evi_bridge::connection::{ConnectRequest, Connector, Credentials, Link, LinkCommand, LinkEvent};
use evi_bridge::{ConnectionError, DeviceError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Which signal tells the session the connection is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The link reports open right after the handshake
    OpenCallback,
    /// No open callback; the service's first frame arrives instead
    FirstMessage,
    /// Neither; only the session's fallback timer can start it
    Silent,
}

pub struct ScriptedConnector {
    trigger: Trigger,
    refuse: bool,
    sent: Arc<Mutex<Vec<String>>>,
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(trigger: Trigger) -> Arc<Self> {
        Arc::new(Self {
            trigger,
            refuse: false,
            sent: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(None),
            connects: AtomicUsize::new(0),
        })
    }

    /// Connector whose handshake always fails
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            trigger: Trigger::Silent,
            refuse: true,
            sent: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(None),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// `type` of every frame sent so far, in order
    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|text| {
                let value: Value = serde_json::from_str(text).unwrap();
                value["type"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    pub fn count_sent(&self, kind: &str) -> usize {
        self.sent_types().iter().filter(|t| *t == kind).count()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Raise a lifecycle callback on the current link
    pub async fn push(&self, event: LinkEvent) {
        let sender = self.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Deliver one inbound frame
    pub async fn push_frame(&self, frame: Value) {
        self.push(LinkEvent::Message(frame.to_string())).await;
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _request: &ConnectRequest) -> Result<Link, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(ConnectionError::Handshake("connection refused".to_string()));
        }

        let (command_tx, mut command_rx) = mpsc::channel::<LinkCommand>(256);
        let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(256);

        match self.trigger {
            Trigger::OpenCallback => {
                let _ = event_tx.try_send(LinkEvent::Opened);
            }
            Trigger::FirstMessage => {
                let _ = event_tx.try_send(LinkEvent::Message(chat_metadata().to_string()));
            }
            Trigger::Silent => {}
        }
        *self.events.lock().unwrap() = Some(event_tx);

        let sent = Arc::clone(&self.sent);
        let writer = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    LinkCommand::Text(text) => sent.lock().unwrap().push(text),
                    LinkCommand::Close { .. } => break,
                }
            }
        });

        Ok(Link {
            commands: command_tx,
            events: event_rx,
            tasks: vec![writer],
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn request() -> ConnectRequest {
    ConnectRequest::new("wss://voice.test/v0/chat", Credentials::ApiKey("test-key".to_string()))
}

/// Microphone producing a 320-byte chunk every few milliseconds until stopped
#[derive(Clone, Default)]
pub struct SteadyMic {
    pub reads: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl CaptureDevice for SteadyMic {
    fn open(&mut self, _format: PcmFormat) -> Result<(), DeviceError> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        std::thread::sleep(Duration::from_millis(5));
        self.reads.fetch_add(1, Ordering::SeqCst);
        let n = buf.len().min(320);
        buf[..n].fill(0x11);
        Ok(n)
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "steady"
    }
}

/// Speaker recording every buffer it is given
#[derive(Clone, Default)]
pub struct RecordingSpeaker {
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub closed: Arc<AtomicUsize>,
}

impl RecordingSpeaker {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

impl PlaybackDevice for RecordingSpeaker {
    fn open(&mut self, _format: PcmFormat) -> Result<(), DeviceError> {
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        self.writes.lock().unwrap().push(buf.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn chat_metadata() -> Value {
    json!({ "type": "chat_metadata", "chat_id": "chat-1", "chat_group_id": "group-1" })
}

/// `audio_output` frame carrying a WAV container of `total_len` bytes
pub fn audio_output(index: u32, total_len: usize) -> Value {
    json!({
        "type": "audio_output",
        "id": "msg-1",
        "index": index,
        "data": base64::engine::general_purpose::STANDARD.encode(wav_container(total_len)),
    })
}

pub fn wav_container(total_len: usize) -> Vec<u8> {
    let header = WavHeader {
        format: PcmFormat::mono16(48000),
        data_len: (total_len - WAV_HEADER_LEN) as u32,
    };
    let mut buf = header.to_bytes().to_vec();
    buf.resize(total_len, 0x22);
    buf
}
