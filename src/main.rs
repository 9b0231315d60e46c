use anyhow::{bail, Result};
use clap::Parser;
use evi_bridge::connection::ConnectionState;
use evi_bridge::protocol::InboundEvent;
use evi_bridge::{
    CaptureDevice, Config, PlaybackDevice, RawPcmCapture, RawPcmPlayback, SessionEvent,
    VoiceSession, WavFileCapture, WavFilePlayback, WebSocketConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Bridge local audio to a conversational voice service
#[derive(Parser, Debug)]
#[command(name = "evi-bridge", version, about)]
struct Args {
    /// Config file (extension optional); environment variables prefixed EVI__ override it
    #[arg(short, long)]
    config: Option<String>,

    /// Microphone input: `-` for raw 16-bit PCM on stdin, or a WAV file
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Speaker output: `-` for raw 16-bit PCM on stdout, or a WAV file to write
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Send this text as the first user message
    #[arg(long)]
    text: Option<String>,

    /// Keep sending microphone audio while the assistant speaks
    #[arg(long)]
    allow_interrupt: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout may carry PCM, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    info!("EVI bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Endpoint: {}", cfg.connection.endpoint);

    let request = cfg.connect_request()?;

    let mut session_config = cfg.session_config();
    if args.allow_interrupt {
        session_config.allow_user_interrupt = true;
    }

    let capture: Box<dyn CaptureDevice> = if args.input == "-" {
        Box::new(RawPcmCapture::new(std::io::stdin(), "stdin"))
    } else {
        Box::new(WavFileCapture::new(&args.input))
    };

    let playback: Box<dyn PlaybackDevice> = if args.output == "-" {
        Box::new(RawPcmPlayback::new(std::io::stdout(), "stdout"))
    } else {
        Box::new(WavFilePlayback::new(&args.output))
    };

    let connector = Arc::new(WebSocketConnector::new(Duration::from_millis(
        cfg.connection.write_timeout_ms,
    )));

    let session = VoiceSession::builder(session_config, connector, capture, playback)
        .connection_options(cfg.connection_options())
        .build();

    let mut events = session.subscribe();

    if !session.connect(&request).await {
        bail!("Failed to connect: {}", session.connection_state());
    }

    let mut pending_text = args.text;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, disconnecting");
                break;
            }
            event = events.recv() => {
                match event {
                    None => break,
                    Some(SessionEvent::Connection(state)) => match state {
                        ConnectionState::Disconnected => {
                            info!("Service closed the session");
                            break;
                        }
                        ConnectionState::Failed(reason) => {
                            warn!("Connection failed: {}", reason);
                            break;
                        }
                        _ => {}
                    },
                    Some(SessionEvent::Inbound(envelope)) => {
                        // The service announces the chat before it accepts input
                        if let InboundEvent::ChatMetadata { .. } = envelope.event {
                            if let Some(text) = pending_text.take() {
                                session.send_text(text).await;
                            }
                        }
                    }
                    Some(SessionEvent::DeviceFailed { direction, message }) => {
                        warn!("{:?} device failed: {}", direction, message);
                    }
                }
            }
        }
    }

    session.disconnect().await;

    let stats = session.stats();
    info!("Session stats: {}", serde_json::to_string(&stats)?);

    Ok(())
}
