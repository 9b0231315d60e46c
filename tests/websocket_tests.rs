// End-to-end test against a local WebSocket server
//
// Runs the real connector, so URL construction, the handshake, framing and
// the close handshake are all exercised.

mod common;

use anyhow::Result;
use common::{audio_output, chat_metadata, wait_until, RecordingSpeaker, SteadyMic};
use evi_bridge::connection::{ConnectRequest, ConnectionState, Credentials, SessionParams};
use evi_bridge::session::{SessionConfig, SessionEvent};
use evi_bridge::{VoiceSession, WebSocketConnector};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Accept one client, greet it, answer once audio arrives, then hang up
/// after the client has resumed sending audio.
/// Returns the `type` of every frame the client sent.
async fn serve_once(listener: TcpListener, uri: Arc<Mutex<String>>) -> Result<Vec<String>> {
    let (stream, _) = listener.accept().await?;
    let record_uri = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *uri.lock().unwrap() = req.uri().to_string();
        Ok(resp)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, record_uri).await?;

    ws.send(Message::Text(chat_metadata().to_string())).await?;

    let mut types = Vec::new();
    let mut answered_at = None;
    let mut closing = false;

    while let Some(message) = ws.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame: Value = serde_json::from_str(&text)?;
        types.push(frame["type"].as_str().unwrap_or_default().to_string());

        let audio_frames = types.iter().filter(|t| *t == "audio_input").count();
        if closing {
            continue;
        }
        match answered_at {
            None if audio_frames >= 3 => {
                answered_at = Some(audio_frames);
                ws.send(Message::Text(audio_output(0, 100).to_string())).await?;
                ws.send(Message::Text(r#"{"type":"assistant_end"}"#.to_string()))
                    .await?;
            }
            Some(at) if audio_frames >= at + 2 => {
                closing = true;
                ws.close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "chat ended".into(),
                }))
                .await?;
            }
            _ => {}
        }
    }

    Ok(types)
}

#[tokio::test]
async fn test_session_over_real_websocket() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let uri = Arc::new(Mutex::new(String::new()));
    let server = tokio::spawn(serve_once(listener, Arc::clone(&uri)));

    let speaker = RecordingSpeaker::default();
    let session = VoiceSession::builder(
        SessionConfig::default(),
        Arc::new(WebSocketConnector::new(Duration::from_secs(2))),
        Box::new(SteadyMic::default()),
        Box::new(speaker.clone()),
    )
    .build();
    let mut events = session.subscribe();

    let mut request = ConnectRequest::new(
        format!("ws://127.0.0.1:{}/v0/evi/chat", port),
        Credentials::ApiKey("local-key".to_string()),
    );
    request.params = SessionParams {
        config_id: Some("cfg-42".to_string()),
        ..SessionParams::default()
    };

    assert!(session.connect(&request).await);

    // Run until the server hangs up
    let mut saw_chat = false;
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Inbound(envelope) if envelope.event.kind() == "chat_metadata" => {
                    saw_chat = true
                }
                SessionEvent::Connection(ConnectionState::Disconnected) => return true,
                _ => {}
            }
        }
        false
    })
    .await?;
    assert!(closed);
    assert!(saw_chat);

    let types = server.await??;
    assert_eq!(types[0], "session_settings");
    assert!(types.iter().filter(|t| *t == "audio_input").count() >= 3);

    let uri = uri.lock().unwrap().clone();
    assert!(uri.starts_with("/v0/evi/chat?"));
    assert!(uri.contains("api_key=local-key"));
    assert!(uri.contains("config_id=cfg-42"));

    // The one audio unit reached the speaker with its header intact
    assert!(wait_until(Duration::from_secs(2), || speaker.writes().len() == 1).await);
    assert_eq!(speaker.writes()[0].len(), 100);

    let stats = session.stats();
    assert_eq!(stats.audio_chunks_received, 1);
    assert!(stats.frames_forwarded >= 3);
    assert!(stats.forwarding_audio);

    session.disconnect().await;
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    Ok(())
}
