//! Transport seam between the connection manager and the wire.
//!
//! A [`Connector`] opens a [`Link`]: a command channel into the socket and an
//! event channel out of it. Events are the lifecycle callbacks the manager
//! turns into state transitions.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::endpoint::ConnectRequest;
use crate::error::ConnectionError;
use crate::protocol::MAX_FRAME_BYTES;

/// Lifecycle callback raised by a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Message(String),
    /// Peer started the close handshake
    Closing { code: u16, reason: String },
    Closed { code: u16, reason: String },
    Failure(String),
    /// The socket refused a frame that was already accepted for sending
    WriteFailed(String),
}

/// Instruction for the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Text(String),
    Close { code: u16, reason: String },
}

/// An established duplex connection
pub struct Link {
    pub commands: mpsc::Sender<LinkCommand>,
    pub events: mpsc::Receiver<LinkEvent>,
    /// I/O tasks serving this link, aborted when the link is torn down
    pub tasks: Vec<JoinHandle<()>>,
}

/// Opens links to the service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake described by `request`
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, ConnectionError>;

    /// Connector name for logging
    fn name(&self) -> &str;
}

/// WebSocket connector over tokio-tungstenite
pub struct WebSocketConnector {
    write_timeout: Duration,
    channel_capacity: usize,
}

impl WebSocketConnector {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            write_timeout,
            channel_capacity: 256,
        }
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Link, ConnectionError> {
        let url = request.url()?;

        let mut handshake = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;

        for (name, value) in request.headers() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
            handshake.headers_mut().insert(name, value);
        }

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_FRAME_BYTES);
        config.max_frame_size = Some(MAX_FRAME_BYTES);

        info!("Opening WebSocket to {}", request.redacted_url());

        let (socket, _response) =
            tokio_tungstenite::connect_async_with_config(handshake, Some(config), true)
                .await
                .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        let (mut sink, mut stream) = socket.split();
        let (command_tx, mut command_rx) = mpsc::channel::<LinkCommand>(self.channel_capacity);
        let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(self.channel_capacity);

        let write_timeout = self.write_timeout;
        // Weak, so the writer never keeps the event channel open past the reader
        let write_failures = event_tx.downgrade();
        let writer = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    LinkCommand::Text(text) => {
                        let failure = match tokio::time::timeout(
                            write_timeout,
                            sink.send(Message::Text(text)),
                        )
                        .await
                        {
                            Ok(Ok(())) => continue,
                            Ok(Err(e)) => format!("WebSocket rejected frame: {}", e),
                            Err(_) => format!(
                                "WebSocket write timed out after {} ms",
                                write_timeout.as_millis()
                            ),
                        };
                        if let Some(events) = write_failures.upgrade() {
                            let _ = events.try_send(LinkEvent::WriteFailed(failure));
                        } else {
                            warn!("{}", failure);
                        }
                    }
                    LinkCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!("Close frame not sent: {}", e);
                        }
                        break;
                    }
                }
            }

            let _ = sink.close().await;
            debug!("WebSocket writer stopped");
        });

        let reader = tokio::spawn(async move {
            if event_tx.send(LinkEvent::Opened).await.is_err() {
                return;
            }

            let mut close_frame = None;

            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(Message::Text(text)) => LinkEvent::Message(text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => LinkEvent::Message(text),
                        Err(_) => {
                            debug!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        close_frame = Some((code, reason.clone()));
                        LinkEvent::Closing { code, reason }
                    }
                    Ok(_) => continue,
                    Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
                    Err(e) => {
                        let _ = event_tx.send(LinkEvent::Failure(e.to_string())).await;
                        return;
                    }
                };

                if event_tx.send(event).await.is_err() {
                    return;
                }
            }

            let (code, reason) =
                close_frame.unwrap_or_else(|| (1006, "connection dropped".to_string()));
            let _ = event_tx.send(LinkEvent::Closed { code, reason }).await;
            debug!("WebSocket reader stopped");
        });

        Ok(Link {
            commands: command_tx,
            events: event_rx,
            tasks: vec![writer, reader],
        })
    }

    fn name(&self) -> &str {
        "websocket"
    }
}
