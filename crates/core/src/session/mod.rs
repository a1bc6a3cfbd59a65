//! The session state machine.
//!
//! A session runs as a single task that owns all mutable state. Callers talk
//! to it through a cloneable [`SessionHandle`]; the asynchronous connect work
//! reports back over an internal channel, so every state change happens on
//! that one task and never concurrently.
//!
//! ```text
//! idle ──connect──▶ connecting ──negotiated──▶ connected
//!  ▲                    │                         │
//!  │                    └────── fatal error ──────┤
//!  │                                              ▼
//!  └───────────────── disconnect ─────────────── error
//! ```

mod negotiation;

use crate::{
    config::{ConnectionConfig, DEFAULT_TOOL_VISIBILITY},
    error::SessionError,
    events::EventStreamProcessor,
    media::{AudioSource, MediaTransport, PlaybackSink},
    protocol::AgentEvent,
    signaling::{SignalingChannel, SignalingConnector},
    tool_tracker::{ToolCallTracker, ToolInvocation},
    transcript::TranscriptEntry,
    transport::PeerConnector,
};
use negotiation::Negotiation;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

/// The observable attributes of the current session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub muted: bool,
    pub last_error: Option<SessionError>,
}

/// The collaborators a session drives.
#[derive(Clone)]
pub struct SessionDeps {
    pub audio: Arc<dyn AudioSource>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub peers: Arc<dyn PeerConnector>,
    pub playback: Option<Arc<dyn PlaybackSink>>,
}

enum Command {
    Connect {
        config: ConnectionConfig,
        ack: oneshot::Sender<bool>,
    },
    Disconnect {
        ack: oneshot::Sender<()>,
    },
    ToggleMute {
        ack: oneshot::Sender<Option<bool>>,
    },
}

/// A report from the connect task, tagged with the epoch it belongs to.
pub(crate) struct Progress {
    epoch: u64,
    step: Step,
}

pub(crate) enum Step {
    SignalingOpened(Arc<dyn SignalingChannel>),
    Established { session_id: Option<String> },
    Event(AgentEvent),
    Failed(SessionError),
}

/// A stable handle to one session. Cloning shares the same session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    transcript: watch::Receiver<Vec<TranscriptEntry>>,
    active_tool: watch::Receiver<Option<ToolInvocation>>,
}

impl SessionHandle {
    /// Starts the session task. It runs until every handle is dropped.
    pub fn spawn(deps: SessionDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let processor = EventStreamProcessor::new();
        let tools = ToolCallTracker::new(DEFAULT_TOOL_VISIBILITY);

        let handle = Self {
            commands: commands_tx,
            status: status_rx,
            transcript: processor.subscribe(),
            active_tool: tools.subscribe(),
        };
        let actor = SessionActor {
            deps,
            epoch: 0,
            status: status_tx,
            processor,
            tools,
            tool_window: DEFAULT_TOOL_VISIBILITY,
            media: None,
            signaling: None,
            progress_tx,
        };
        tokio::spawn(actor.run(commands_rx, progress_rx));
        handle
    }

    /// Starts connecting. Returns `false`, without touching the session, when
    /// the session is not idle.
    pub async fn connect(&self, config: ConnectionConfig) -> bool {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Connect { config, ack }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Tears the session down and returns once it is idle.
    pub async fn disconnect(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flips the mute flag. Returns the new flag, or `None` when not connected.
    pub async fn toggle_mute(&self) -> Option<bool> {
        let (ack, rx) = oneshot::channel();
        self.commands.send(Command::ToggleMute { ack }).ok()?;
        rx.await.ok().flatten()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.borrow().clone()
    }

    pub fn active_tool(&self) -> Option<String> {
        self.active_tool.borrow().as_ref().map(|t| t.name.clone())
    }

    pub fn error(&self) -> Option<String> {
        self.status.borrow().last_error.as_ref().map(|e| e.to_string())
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Vec<TranscriptEntry>> {
        self.transcript.clone()
    }

    pub fn subscribe_active_tool(&self) -> watch::Receiver<Option<ToolInvocation>> {
        self.active_tool.clone()
    }
}

struct SessionActor {
    deps: SessionDeps,
    /// Bumped on every connect and teardown; stale reports are discarded.
    epoch: u64,
    status: watch::Sender<SessionStatus>,
    processor: EventStreamProcessor,
    tools: ToolCallTracker,
    tool_window: Duration,
    media: Option<Arc<MediaTransport>>,
    signaling: Option<Arc<dyn SignalingChannel>>,
    progress_tx: mpsc::UnboundedSender<Progress>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut progress: mpsc::UnboundedReceiver<Progress>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(report) = progress.recv() => self.handle_progress(report).await,
            }
        }
        if self.state() != SessionState::Idle {
            self.disconnect().await;
        }
        debug!("Session task finished.");
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { config, ack } => {
                let _ = ack.send(self.connect(config));
            }
            Command::Disconnect { ack } => {
                self.disconnect().await;
                let _ = ack.send(());
            }
            Command::ToggleMute { ack } => {
                let _ = ack.send(self.toggle_mute());
            }
        }
    }

    fn connect(&mut self, config: ConnectionConfig) -> bool {
        let state = self.state();
        if state != SessionState::Idle {
            warn!(?state, "Ignoring connect request: session is not idle.");
            return false;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        info!(epoch, endpoint = %config.endpoint_url, "Connecting voice session.");

        let config = Arc::new(config);
        let media = Arc::new(MediaTransport::new(self.deps.playback.clone()));
        self.media = Some(media.clone());
        self.tool_window = config.tool_visibility;
        self.processor.reset();
        self.tools.clear();
        self.status.send_modify(|s| {
            *s = SessionStatus {
                state: SessionState::Connecting,
                ..SessionStatus::default()
            }
        });

        let negotiation = Negotiation {
            epoch,
            config,
            media,
            audio: self.deps.audio.clone(),
            signaling: self.deps.signaling.clone(),
            peers: self.deps.peers.clone(),
            progress: self.progress_tx.clone(),
        };
        let feed = tokio::spawn(negotiation.run().instrument(info_span!("negotiation", epoch)));
        self.processor.attach_feed(feed);
        true
    }

    async fn handle_progress(&mut self, report: Progress) {
        if report.epoch != self.epoch {
            debug!(
                report_epoch = report.epoch,
                epoch = self.epoch,
                "Discarding report from a superseded connect."
            );
            if let Step::SignalingOpened(channel) = report.step {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Closing superseded signaling channel failed.");
                }
            }
            return;
        }

        match report.step {
            Step::SignalingOpened(channel) => {
                self.signaling = Some(channel);
            }
            Step::Established { session_id } => {
                if self.state() != SessionState::Connecting {
                    return;
                }
                let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
                info!(%session_id, "Voice session connected.");
                self.processor.begin();
                self.tools.arm(self.tool_window);
                self.status.send_modify(|s| {
                    s.state = SessionState::Connected;
                    s.session_id = Some(session_id);
                });
            }
            Step::Event(event) => {
                if let Err(e) = self.processor.apply(event, &mut self.tools) {
                    self.fail(e).await;
                }
            }
            Step::Failed(e) => self.fail(e).await,
        }
    }

    fn toggle_mute(&mut self) -> Option<bool> {
        let state = self.state();
        let Some(media) = self.media.as_ref().filter(|_| state == SessionState::Connected) else {
            warn!(?state, "Ignoring mute toggle: session is not connected.");
            return None;
        };
        let muted = !media.is_muted();
        media.set_muted(muted);
        self.status.send_modify(|s| s.muted = muted);
        info!(muted, "Outbound audio toggled.");
        Some(muted)
    }

    /// Moves to `error`, releasing everything the session held. The
    /// transcript is kept so the caller can still show it.
    #[instrument(skip_all, fields(epoch = self.epoch))]
    async fn fail(&mut self, err: SessionError) {
        error!(error = %err, kind = ?err.kind(), "Voice session failed.");
        self.epoch += 1;
        self.release().await;
        self.tools.disarm();
        self.status.send_modify(|s| {
            s.state = SessionState::Error;
            s.muted = false;
            s.last_error = Some(err);
        });
    }

    /// Returns to `idle` from any state. Never fails.
    #[instrument(skip_all, fields(epoch = self.epoch))]
    async fn disconnect(&mut self) {
        let state = self.state();
        self.epoch += 1;
        self.release().await;
        self.tools.disarm();
        self.processor.reset();
        self.status.send_replace(SessionStatus::default());
        if state != SessionState::Idle {
            info!(from = ?state, "Voice session disconnected.");
        }
    }

    /// Stops the processor, then releases media, then closes signaling, each
    /// step finishing before the next starts. Failures are logged only.
    async fn release(&mut self) {
        self.processor.shutdown().await;
        if let Some(media) = self.media.take() {
            if let Err(e) = media.release().await {
                warn!(error = %e, "Media teardown failed.");
            }
        }
        if let Some(channel) = self.signaling.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Signaling teardown failed.");
            }
        }
    }
}
