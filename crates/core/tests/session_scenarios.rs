use async_trait::async_trait;
use mockall::mock;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Notify, mpsc};
use voice_session_core::{
    ActivationListener, AudioSource, ConfigProvider, CaptureDevice, ConnectionConfig, ErrorKind, IceCandidate, LocalAudio,
    PeerConnector, PeerEvent, PeerTransport, RemoteAudio, Role, SessionDeps, SessionError,
    SessionHandle, SessionState, SessionStatus, WireMessage,
    media::AudioFrame,
    signaling::{SignalingChannel, SignalingConnector, SignalingLink},
};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------- fakes ----

struct FakeDevice;

impl CaptureDevice for FakeDevice {
    fn name(&self) -> &str {
        "fake-mic"
    }

    fn stop(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct FakeSource;

#[async_trait]
impl AudioSource for FakeSource {
    async fn acquire(&self) -> Result<LocalAudio, SessionError> {
        let (_tx, frames) = mpsc::channel::<AudioFrame>(4);
        Ok(LocalAudio {
            device: Box::new(FakeDevice),
            frames,
        })
    }
}

mock! {
    pub Source {}

    #[async_trait]
    impl AudioSource for Source {
        async fn acquire(&self) -> Result<LocalAudio, SessionError>;
    }
}

/// Signaling that records what was sent and lets the test inject frames.
#[derive(Default)]
struct FakeSignaling {
    /// Frames sent back, in order, as soon as the offer arrives.
    replies: Vec<String>,
    sent: Mutex<Vec<WireMessage>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    offered: Notify,
}

impl FakeSignaling {
    fn answering(session_id: &str) -> Self {
        Self::replying(vec![format!(
            r#"{{"type":"answer","sdp":"v=0 answer","session_id":"{session_id}"}}"#
        )])
    }

    fn replying(replies: Vec<String>) -> Self {
        Self {
            replies,
            ..Self::default()
        }
    }

    fn inject(&self, frame: &str) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(frame.to_string());
        }
    }

    fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().unwrap().clone()
    }
}

struct FakeChannel(Arc<FakeSignaling>);

#[async_trait]
impl SignalingChannel for FakeChannel {
    async fn send(&self, message: WireMessage) -> Result<(), SessionError> {
        let is_offer = matches!(message, WireMessage::Offer { .. });
        self.0.sent.lock().unwrap().push(message);
        if is_offer {
            for reply in &self.0.replies {
                self.0.inject(reply);
            }
            self.0.offered.notify_one();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeConnector(Arc<FakeSignaling>);

#[async_trait]
impl SignalingConnector for FakeConnector {
    async fn open(&self, _config: &ConnectionConfig) -> Result<SignalingLink, SessionError> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, inbound) = mpsc::unbounded_channel();
        *self.0.inbound.lock().unwrap() = Some(tx);
        Ok(SignalingLink {
            channel: Arc::new(FakeChannel(self.0.clone())),
            inbound,
        })
    }
}

/// A peer that gathers one candidate with the offer and connects as soon as
/// an answer is applied.
struct FakePeer {
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    closes: AtomicUsize,
    fail_close: bool,
}

impl FakePeer {
    fn new(fail_close: bool) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            remote_candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_close,
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn create_offer(&self) -> Result<String, SessionError> {
        self.emit(PeerEvent::LocalCandidate(IceCandidate::new(
            "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host",
        )));
        Ok("v=0 offer".to_string())
    }

    async fn apply_answer(&self, _sdp: &str) -> Result<(), SessionError> {
        self.emit(PeerEvent::Connected);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn send_audio(&self, _frame: AudioFrame) -> Result<(), SessionError> {
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn take_remote_audio(&self) -> Option<RemoteAudio> {
        None
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(SessionError::Transport("close timed out".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakePeers {
    fail_close: bool,
    last: Mutex<Option<Arc<FakePeer>>>,
}

impl FakePeers {
    fn last(&self) -> Arc<FakePeer> {
        self.last.lock().unwrap().clone().expect("no peer was created")
    }
}

#[async_trait]
impl PeerConnector for FakePeers {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Arc<dyn PeerTransport>, SessionError> {
        let peer = Arc::new(FakePeer::new(self.fail_close));
        *self.last.lock().unwrap() = Some(peer.clone());
        Ok(peer)
    }
}

/// Counts snapshots; fails every one when `fail` is set.
#[derive(Default)]
struct CountingProvider {
    snapshots: AtomicUsize,
    fail: bool,
}

impl ConfigProvider for CountingProvider {
    type Error = String;

    fn snapshot(&self) -> Result<ConnectionConfig, String> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("settings file unreadable".to_string());
        }
        Ok(config())
    }
}

// -------------------------------------------------------------- helpers ----

struct Harness {
    session: SessionHandle,
    signaling: Arc<FakeSignaling>,
    peers: Arc<FakePeers>,
}

fn harness_with(signaling: FakeSignaling, peers: FakePeers, audio: Arc<dyn AudioSource>) -> Harness {
    let signaling = Arc::new(signaling);
    let peers = Arc::new(peers);
    let session = SessionHandle::spawn(SessionDeps {
        audio,
        signaling: Arc::new(FakeConnector(signaling.clone())),
        peers: peers.clone(),
        playback: None,
    });
    Harness {
        session,
        signaling,
        peers,
    }
}

fn harness(signaling: FakeSignaling) -> Harness {
    harness_with(signaling, FakePeers::default(), Arc::new(FakeSource))
}

fn config() -> ConnectionConfig {
    ConnectionConfig::new("ws://agent.test/ws")
}

async fn wait_for_state(session: &SessionHandle, state: SessionState) -> SessionStatus {
    let mut rx = session.subscribe_status();
    let status = tokio::time::timeout(WAIT, rx.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("session task ended")
        .clone();
    status
}

async fn wait_for_transcript(session: &SessionHandle, last: &str) {
    let mut rx = session.subscribe_transcript();
    tokio::time::timeout(
        WAIT,
        rx.wait_for(|t| t.last().is_some_and(|e| e.content == last)),
    )
    .await
    .expect("timed out waiting for transcript")
    .expect("session task ended");
}

async fn wait_for_tool(session: &SessionHandle, present: bool) {
    let mut rx = session.subscribe_active_tool();
    tokio::time::timeout(WAIT, rx.wait_for(|t| t.is_some() == present))
        .await
        .expect("timed out waiting for tool indicator")
        .expect("session task ended");
}

async fn connected(signaling: FakeSignaling) -> Harness {
    let h = harness(signaling);
    assert!(h.session.connect(config()).await);
    wait_for_state(&h.session, SessionState::Connected).await;
    h
}

fn transcript_frame(role: &str, content: &str, is_final: bool) -> String {
    format!(r#"{{"type":"transcript","role":"{role}","content":"{content}","final":{is_final}}}"#)
}

// ---------------------------------------------------------------- tests ----

#[tokio::test]
async fn test_negotiation_reaches_connected_with_agent_session_id() {
    let h = connected(FakeSignaling::answering("pc-7")).await;

    let status = h.session.status();
    assert_eq!(status.session_id.as_deref(), Some("pc-7"));
    assert!(!status.muted);
    assert!(status.last_error.is_none());

    // The early candidate is held back until the answer is known.
    let sent = h.signaling.sent();
    assert!(matches!(sent[0], WireMessage::Offer { .. }));
    assert!(matches!(sent[1], WireMessage::IceCandidate { .. }));
    assert_eq!(sent.len(), 2);
}

#[tokio::test]
async fn test_missing_session_id_gets_generated_identity() {
    let h = connected(FakeSignaling::replying(vec![
        r#"{"type":"answer","sdp":"v=0 answer"}"#.to_string(),
    ]))
    .await;
    let id = h.session.status().session_id.expect("session id");
    assert_eq!(id.len(), 36);
}

#[tokio::test]
async fn test_streamed_assistant_reply_is_merged() {
    let h = connected(FakeSignaling::answering("pc-1")).await;

    h.signaling.inject(&transcript_frame("user", "hi", true));
    h.signaling
        .inject(r#"{"type":"transcript","role":"assistant","content":"Hel"}"#);
    h.signaling
        .inject(r#"{"type":"transcript","role":"assistant","content":"Hello"}"#);
    wait_for_transcript(&h.session, "Hello").await;

    let transcript = h.session.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].content, "hi");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content, "Hello");
}

#[tokio::test]
async fn test_partial_user_transcript_is_not_recorded() {
    let h = connected(FakeSignaling::answering("pc-1")).await;

    h.signaling.inject(&transcript_frame("user", "what's the wea", false));
    h.signaling.inject(&transcript_frame("assistant", "marker", true));
    wait_for_transcript(&h.session, "marker").await;

    assert_eq!(h.session.transcript().len(), 1);
}

#[tokio::test]
async fn test_events_on_data_channel_are_applied() {
    let h = connected(FakeSignaling::answering("pc-1")).await;

    h.peers.last().emit(PeerEvent::Message(transcript_frame(
        "assistant",
        "from the data channel",
        false,
    )));
    wait_for_transcript(&h.session, "from the data channel").await;
}

#[tokio::test]
async fn test_events_before_connected_are_replayed() {
    let h = connected(FakeSignaling::replying(vec![
        transcript_frame("assistant", "Welcome", true),
        r#"{"type":"answer","sdp":"v=0 answer"}"#.to_string(),
    ]))
    .await;

    wait_for_transcript(&h.session, "Welcome").await;
    assert_eq!(h.session.transcript().len(), 1);
}

#[tokio::test]
async fn test_malformed_event_is_dropped_without_ending_session() {
    let h = connected(FakeSignaling::answering("pc-1")).await;

    h.signaling.inject("{garbage");
    h.signaling.inject(r#"{"type":"mystery"}"#);
    h.signaling.inject(&transcript_frame("user", "still here", true));
    wait_for_transcript(&h.session, "still here").await;

    let status = h.session.status();
    assert_eq!(status.state, SessionState::Connected);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_remote_candidates_are_applied_to_peer() {
    let h = connected(FakeSignaling::answering("pc-1")).await;

    h.signaling.inject(
        r#"{"type":"ice-candidate","candidate":"candidate:9 1 udp 1 10.0.0.9 9 typ host","sdp_mid":"0"}"#,
    );
    h.signaling.inject(&transcript_frame("user", "sync", true));
    wait_for_transcript(&h.session, "sync").await;

    let applied = h.peers.last().remote_candidates.lock().unwrap().clone();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].sdp_mid.as_deref(), Some("0"));
}

#[tokio::test]
async fn test_connect_while_connecting_is_ignored() {
    let h = harness(FakeSignaling::default());
    assert!(h.session.connect(config()).await);
    h.signaling.offered.notified().await;
    assert_eq!(h.session.state(), SessionState::Connecting);

    assert!(!h.session.connect(config()).await);
    assert_eq!(h.session.state(), SessionState::Connecting);
    assert_eq!(h.signaling.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_while_connected_is_ignored() {
    let h = connected(FakeSignaling::answering("pc-1")).await;
    h.signaling.inject(&transcript_frame("user", "hi", true));
    wait_for_transcript(&h.session, "hi").await;
    let status = h.session.status();
    let transcript = h.session.transcript();

    assert!(!h.session.connect(config()).await);

    assert_eq!(h.session.status(), status);
    assert_eq!(h.session.transcript(), transcript);
    assert_eq!(h.signaling.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_always_returns_to_idle() {
    let peers = FakePeers {
        fail_close: true,
        ..FakePeers::default()
    };
    let h = harness_with(
        FakeSignaling::answering("pc-1"),
        peers,
        Arc::new(FakeSource),
    );
    assert!(h.session.connect(config()).await);
    wait_for_state(&h.session, SessionState::Connected).await;

    h.signaling.inject(&transcript_frame("user", "hi", true));
    h.signaling
        .inject(r#"{"type":"tool-invocation","function_name":"search"}"#);
    wait_for_tool(&h.session, true).await;
    assert!(!h.session.transcript().is_empty());

    h.session.disconnect().await;

    assert_eq!(h.session.status(), SessionStatus::default());
    assert_eq!(h.session.active_tool(), None);
    assert!(h.session.transcript().is_empty());
    assert_eq!(h.peers.last().closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.signaling.closes.load(Ordering::SeqCst), 1);

    // Idle to idle is also fine.
    h.session.disconnect().await;
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_disconnect_from_error_clears_error() {
    let h = connected(FakeSignaling::answering("pc-1")).await;
    h.peers.last().emit(PeerEvent::Failed("ice failed".to_string()));
    wait_for_state(&h.session, SessionState::Error).await;

    h.session.disconnect().await;
    assert_eq!(h.session.status(), SessionStatus::default());
    assert_eq!(h.session.error(), None);
}

#[tokio::test(start_paused = true)]
async fn test_tool_indicator_clears_after_window() {
    let h = harness(FakeSignaling::answering("pc-1"));
    let config = config().with_tool_visibility(Duration::from_millis(500));
    assert!(h.session.connect(config).await);
    wait_for_state(&h.session, SessionState::Connected).await;

    h.signaling
        .inject(r#"{"type":"tool-invocation","function_name":"search"}"#);
    wait_for_tool(&h.session, true).await;
    assert_eq!(h.session.active_tool().as_deref(), Some("search"));

    tokio::time::sleep(Duration::from_millis(499)).await;
    assert_eq!(h.session.active_tool().as_deref(), Some("search"));

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(h.session.active_tool(), None);
}

#[tokio::test]
async fn test_device_denied_moves_to_error() {
    let mut source = MockSource::new();
    source
        .expect_acquire()
        .times(1)
        .returning(|| Err(SessionError::DeviceAccess("permission denied".to_string())));
    let h = harness_with(
        FakeSignaling::answering("pc-1"),
        FakePeers::default(),
        Arc::new(source),
    );

    assert!(h.session.connect(config()).await);
    let status = wait_for_state(&h.session, SessionState::Error).await;

    let err = status.last_error.expect("last error");
    assert_eq!(err.kind(), ErrorKind::DeviceAccess);
    assert!(h.session.transcript().is_empty());
    assert_eq!(h.signaling.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_late_negotiation_success_after_disconnect_is_ignored() {
    let h = harness(FakeSignaling::default());
    assert!(h.session.connect(config()).await);
    h.signaling.offered.notified().await;

    h.session.disconnect().await;
    assert_eq!(h.session.state(), SessionState::Idle);

    // The answer and the connected report both arrive too late.
    h.signaling
        .inject(r#"{"type":"answer","sdp":"v=0 answer","session_id":"late"}"#);
    h.peers.last().emit(PeerEvent::Connected);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.session.status(), SessionStatus::default());
    assert_eq!(h.peers.last().closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.signaling.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout_is_signaling_error() {
    let h = harness(FakeSignaling::default());
    let config = config().with_negotiation_timeout(Duration::from_secs(1));
    assert!(h.session.connect(config).await);

    let status = wait_for_state(&h.session, SessionState::Error).await;
    assert!(matches!(status.last_error, Some(SessionError::Signaling(_))));
    assert_eq!(h.peers.last().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_agent_error_event_is_fatal_and_keeps_transcript() {
    let h = connected(FakeSignaling::answering("pc-1")).await;
    h.signaling.inject(&transcript_frame("user", "hi", true));
    wait_for_transcript(&h.session, "hi").await;

    h.signaling
        .inject(r#"{"type":"error","message":"pipeline crashed"}"#);
    let status = wait_for_state(&h.session, SessionState::Error).await;

    assert_eq!(
        status.last_error,
        Some(SessionError::Transport("pipeline crashed".to_string()))
    );
    assert_eq!(h.session.transcript().len(), 1);
    assert_eq!(h.peers.last().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transport_failure_after_connect_is_fatal() {
    let h = connected(FakeSignaling::answering("pc-1")).await;
    h.peers.last().emit(PeerEvent::Failed("ice failed".to_string()));

    let status = wait_for_state(&h.session, SessionState::Error).await;
    assert_eq!(
        status.last_error.map(|e| e.kind()),
        Some(ErrorKind::Transport)
    );
}

#[tokio::test]
async fn test_transport_failure_during_negotiation_is_signaling_error() {
    let h = harness(FakeSignaling::default());
    assert!(h.session.connect(config()).await);
    h.signaling.offered.notified().await;

    h.peers.last().emit(PeerEvent::Failed("no route".to_string()));
    let status = wait_for_state(&h.session, SessionState::Error).await;
    assert_eq!(
        status.last_error.map(|e| e.kind()),
        Some(ErrorKind::Signaling)
    );
}

#[tokio::test]
async fn test_signaling_loss_after_connect_is_not_fatal() {
    let h = connected(FakeSignaling::answering("pc-1")).await;
    // Dropping the only sender ends the inbound stream.
    h.signaling.inbound.lock().unwrap().take();

    h.peers
        .last()
        .emit(PeerEvent::Message(transcript_frame("assistant", "still talking", true)));
    wait_for_transcript(&h.session, "still talking").await;
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_toggle_mute_only_when_connected() {
    let h = harness(FakeSignaling::answering("pc-1"));
    assert_eq!(h.session.toggle_mute().await, None);

    assert!(h.session.connect(config()).await);
    wait_for_state(&h.session, SessionState::Connected).await;

    assert_eq!(h.session.toggle_mute().await, Some(true));
    assert!(h.session.status().muted);
    assert_eq!(h.session.toggle_mute().await, Some(false));
    assert!(!h.session.status().muted);
}

#[tokio::test]
async fn test_reconnect_after_error_starts_fresh() {
    let h = connected(FakeSignaling::answering("pc-1")).await;
    h.signaling.inject(&transcript_frame("user", "hi", true));
    wait_for_transcript(&h.session, "hi").await;
    h.peers.last().emit(PeerEvent::Failed("ice failed".to_string()));
    wait_for_state(&h.session, SessionState::Error).await;

    // Connecting again requires going through idle first.
    assert!(!h.session.connect(config()).await);
    h.session.disconnect().await;
    assert!(h.session.connect(config()).await);
    let status = wait_for_state(&h.session, SessionState::Connected).await;

    assert!(status.last_error.is_none());
    assert!(h.session.transcript().is_empty());
    assert_eq!(h.signaling.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_agent_error_during_negotiation_is_surfaced() {
    let h = harness(FakeSignaling::replying(vec![
        r#"{"type":"error","message":"agent refused: bad credentials"}"#.to_string(),
    ]));
    let started = tokio::time::Instant::now();
    assert!(h.session.connect(config()).await);

    let status = wait_for_state(&h.session, SessionState::Error).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        status.last_error,
        Some(SessionError::Signaling(
            "agent refused: bad credentials".to_string()
        ))
    );
    assert!(h.session.transcript().is_empty());
    assert_eq!(h.peers.last().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_activation_connects_with_fresh_snapshot() {
    let h = harness(FakeSignaling::answering("pc-1"));
    let provider = Arc::new(CountingProvider::default());
    let activation = ActivationListener::new(h.session.clone(), provider.clone());

    assert!(activation.trigger().await);
    wait_for_state(&h.session, SessionState::Connected).await;
    assert_eq!(provider.snapshots.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_activation_while_active_is_ignored() {
    let h = connected(FakeSignaling::answering("pc-1")).await;
    h.signaling.inject(&transcript_frame("user", "hi", true));
    wait_for_transcript(&h.session, "hi").await;
    let provider = Arc::new(CountingProvider::default());
    let activation = ActivationListener::new(h.session.clone(), provider.clone());

    assert!(!activation.trigger().await);
    assert!(!activation.trigger().await);

    // Each trigger reads its own snapshot, exactly like a manual connect.
    assert_eq!(provider.snapshots.load(Ordering::SeqCst), 2);
    assert_eq!(h.session.state(), SessionState::Connected);
    assert_eq!(h.session.transcript().len(), 1);
    assert_eq!(h.signaling.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_activation_with_unavailable_config_is_ignored() {
    let h = harness(FakeSignaling::answering("pc-1"));
    let provider = Arc::new(CountingProvider {
        fail: true,
        ..CountingProvider::default()
    });
    let activation = ActivationListener::new(h.session.clone(), provider.clone());

    assert!(!activation.trigger().await);
    assert_eq!(provider.snapshots.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.status(), SessionStatus::default());
    assert_eq!(h.signaling.opens.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_activation_listener_stops_when_source_closes() {
    let h = harness(FakeSignaling::answering("pc-1"));
    let provider = Arc::new(CountingProvider::default());
    let (signals, rx) = mpsc::channel(1);
    let listener = ActivationListener::new(h.session.clone(), provider.clone()).spawn(rx);

    signals.send(()).await.unwrap();
    wait_for_state(&h.session, SessionState::Connected).await;

    drop(signals);
    tokio::time::timeout(WAIT, listener)
        .await
        .expect("listener did not stop")
        .unwrap();
    assert_eq!(provider.snapshots.load(Ordering::SeqCst), 1);
}
