//! Main Entrypoint for the Voice Client
//!
//! This binary is responsible for:
//! 1. Parsing command-line arguments and initializing logging.
//! 2. Validating the connection configuration from the environment.
//! 3. Building a session from the cpal microphone, endpoint signaling and
//!    the WebRTC transport.
//! 4. Feeding activation triggers and console commands into the session.
//! 5. Tearing the session down on quit or `Ctrl+C`.

use anyhow::Context;
use clap::Parser;
use std::{io::BufRead, sync::Arc, thread};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_client::{EnvConfigProvider, LoggingPlaybackSink, format_status, render};
use voice_native_utils::{CpalAudioSource, input_device_names};
use voice_session_core::{
    ActivationListener, ConfigProvider, EndpointSignaling, SessionDeps, SessionHandle,
};
use voice_webrtc_transport::WebRtcConnector;

const HELP: &str = "commands: <enter>/w activate | c connect | m mute | d disconnect | s status | q quit";

#[derive(Parser, Debug)]
#[command(version, about = "Talk to a realtime voice agent from the terminal")]
struct Args {
    /// Signaling endpoint; overrides VOICE_ENDPOINT_URL.
    #[arg(long)]
    endpoint: Option<String>,

    /// Connect as soon as the client starts.
    #[arg(long)]
    auto_connect: bool,

    /// Capture from this input device instead of the default one.
    #[arg(long)]
    input_device: Option<String>,

    /// Print the available input devices and exit.
    #[arg(long)]
    list_devices: bool,
}

/// Forwards stdin lines from a plain thread; the reader is left behind on exit.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    if args.list_devices {
        for name in input_device_names().context("Failed to enumerate input devices")? {
            println!("{name}");
        }
        return Ok(());
    }

    // --- 2. Load Configuration ---
    let provider = Arc::new(EnvConfigProvider::new(args.endpoint.clone()));
    let startup = provider.snapshot().context("Failed to load configuration")?;
    info!(endpoint = %startup.endpoint_url, "Configuration loaded.");

    // --- 3. Build the Session ---
    let audio = match args.input_device {
        Some(name) => CpalAudioSource::with_device(name),
        None => CpalAudioSource::new(),
    };
    let playback = LoggingPlaybackSink::new();
    let session = SessionHandle::spawn(SessionDeps {
        audio: Arc::new(audio),
        signaling: Arc::new(EndpointSignaling),
        peers: Arc::new(WebRtcConnector),
        playback: Some(Arc::new(playback.clone())),
    });
    let renderer = tokio::spawn(render(session.clone()));

    // --- 4. Wire Activation and Console Commands ---
    let (activate_tx, activate_rx) = mpsc::channel(4);
    let activation = ActivationListener::new(session.clone(), provider.clone());
    let listener = activation.spawn(activate_rx);

    if args.auto_connect {
        session.connect(startup).await;
    }

    println!("{HELP}");
    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal. Shutting down gracefully...");
                break;
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                match line.trim() {
                    "" | "w" => {
                        if activate_tx.try_send(()).is_err() {
                            warn!("Activation dropped: previous triggers still pending.");
                        }
                    }
                    "c" => match provider.snapshot() {
                        Ok(config) => {
                            if !session.connect(config).await {
                                println!("already active; disconnect first");
                            }
                        }
                        Err(e) => warn!(error = %e, "Cannot connect."),
                    },
                    "m" => match session.toggle_mute().await {
                        Some(true) => println!("microphone muted"),
                        Some(false) => println!("microphone live"),
                        None => println!("not connected"),
                    },
                    "d" => session.disconnect().await,
                    "s" => println!("{}", format_status(&session.status())),
                    "q" => break,
                    other => println!("unknown command '{other}'; {HELP}"),
                }
            }
        }
    }

    // --- 5. Shutdown ---
    drop(activate_tx);
    let _ = listener.await;
    session.disconnect().await;
    drop(session);
    renderer.abort();
    info!(bytes = playback.bytes_received(), "Voice client stopped.");
    Ok(())
}
