//! The per-connect task: acquires audio, negotiates the transport, then
//! feeds inbound events to the session until it is aborted.
//!
//! Everything it learns is posted back to the session tagged with the epoch
//! of the `connect()` call that started it; the session drops anything
//! tagged with an older epoch.

use super::{Progress, Step};
use crate::{
    config::ConnectionConfig,
    error::SessionError,
    events::{Routed, route_frame},
    media::{AudioSource, MediaTransport},
    protocol::{AgentEvent, IceCandidate, WireMessage},
    signaling::{NegotiationState, SignalingChannel, SignalingConnector, SignalingLink},
    transport::{PeerConnector, PeerEvent, PeerTransport},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) struct Negotiation {
    pub epoch: u64,
    pub config: Arc<ConnectionConfig>,
    pub media: Arc<MediaTransport>,
    pub audio: Arc<dyn AudioSource>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub peers: Arc<dyn PeerConnector>,
    pub progress: mpsc::UnboundedSender<Progress>,
}

impl Negotiation {
    pub async fn run(self) {
        if let Err(e) = self.drive().await {
            self.post(Step::Failed(e));
        }
    }

    fn post(&self, step: Step) -> bool {
        self.progress
            .send(Progress {
                epoch: self.epoch,
                step,
            })
            .is_ok()
    }

    async fn drive(&self) -> Result<(), SessionError> {
        self.media.acquire_local_audio(self.audio.as_ref()).await?;

        let SignalingLink {
            channel,
            mut inbound,
        } = self.signaling.open(&self.config).await?;
        self.post(Step::SignalingOpened(channel.clone()));

        let peer = self.peers.connect(&self.config).await.map_err(as_signaling)?;
        self.media.attach(peer.clone()).await?;
        let mut peer_events = peer.take_events().ok_or_else(|| {
            SessionError::Signaling("peer transport event stream unavailable".to_string())
        })?;

        let mut link = Link {
            negotiation: self,
            peer,
            channel,
            state: NegotiationState::new(),
            session_id: None,
            held: Some(Vec::new()),
        };
        link.negotiate(&mut inbound, &mut peer_events)
            .await
            .map_err(as_signaling)?;
        if !link.establish() {
            return Ok(());
        }
        link.feed(inbound, peer_events).await
    }
}

/// Anything failing before the transport is ready is a rejected negotiation.
fn as_signaling(err: SessionError) -> SessionError {
    match err {
        SessionError::Transport(message) => SessionError::Signaling(message),
        other => other,
    }
}

struct Link<'a> {
    negotiation: &'a Negotiation,
    peer: Arc<dyn PeerTransport>,
    channel: Arc<dyn SignalingChannel>,
    state: NegotiationState,
    session_id: Option<String>,
    /// Events received while still connecting, replayed once established.
    held: Option<Vec<AgentEvent>>,
}

impl Link<'_> {
    /// Sends the offer and trades answer and candidates until the transport
    /// reports ready.
    async fn negotiate(
        &mut self,
        inbound: &mut mpsc::UnboundedReceiver<String>,
        peer_events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Result<(), SessionError> {
        let offer = self.peer.create_offer().await?;
        self.state.set_local_description(offer.clone());
        self.channel.send(WireMessage::Offer { sdp: offer }).await?;
        debug!("Offer sent.");

        let deadline = tokio::time::sleep(self.negotiation.config.negotiation_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(SessionError::Signaling("negotiation timed out".to_string()));
                }
                frame = inbound.recv() => match frame {
                    Some(text) => self.on_frame(&text).await?,
                    None => {
                        return Err(SessionError::Signaling(
                            "signaling channel closed during negotiation".to_string(),
                        ));
                    }
                },
                event = peer_events.recv() => match event {
                    Some(PeerEvent::Connected) => return Ok(()),
                    Some(PeerEvent::LocalCandidate(candidate)) => {
                        self.on_local_candidate(candidate).await?;
                    }
                    Some(PeerEvent::Message(text)) => self.on_frame(&text).await?,
                    Some(PeerEvent::Failed(reason)) => {
                        return Err(SessionError::Signaling(format!(
                            "transport failed to establish: {reason}"
                        )));
                    }
                    Some(PeerEvent::Closed) | None => {
                        return Err(SessionError::Signaling(
                            "transport closed during negotiation".to_string(),
                        ));
                    }
                },
            }
        }
    }

    /// Reports the established session and replays held events.
    fn establish(&mut self) -> bool {
        info!(session_id = ?self.session_id, "Transport established.");
        if !self.negotiation.post(Step::Established {
            session_id: self.session_id.clone(),
        }) {
            return false;
        }
        for event in self.held.take().unwrap_or_default() {
            if !self.negotiation.post(Step::Event(event)) {
                return false;
            }
        }
        true
    }

    /// Forwards inbound events until the transport fails or the session
    /// goes away. Losing the signaling channel alone is not fatal.
    async fn feed(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<String>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Result<(), SessionError> {
        let mut signaling_open = true;
        loop {
            tokio::select! {
                frame = inbound.recv(), if signaling_open => match frame {
                    Some(text) => {
                        if let Err(e) = self.on_frame(&text).await {
                            warn!(error = %e, "Failed to apply signaling message.");
                        }
                    }
                    None => {
                        info!("Signaling channel closed; media continues.");
                        signaling_open = false;
                    }
                },
                event = peer_events.recv() => match event {
                    Some(PeerEvent::Message(text)) => {
                        if let Err(e) = self.on_frame(&text).await {
                            warn!(error = %e, "Failed to apply data channel message.");
                        }
                    }
                    Some(PeerEvent::LocalCandidate(candidate)) if signaling_open => {
                        if let Err(e) = self.on_local_candidate(candidate).await {
                            warn!(error = %e, "Failed to send late ICE candidate.");
                        }
                    }
                    Some(PeerEvent::LocalCandidate(_)) | Some(PeerEvent::Connected) => {}
                    Some(PeerEvent::Failed(reason)) => return Err(SessionError::Transport(reason)),
                    Some(PeerEvent::Closed) | None => {
                        return Err(SessionError::Transport("peer transport closed".to_string()));
                    }
                },
            }
            if self.negotiation.progress.is_closed() {
                return Ok(());
            }
        }
    }

    async fn on_frame(&mut self, text: &str) -> Result<(), SessionError> {
        match route_frame(text) {
            Routed::Event(event) => {
                match (self.held.as_mut(), event) {
                    // The agent rejected the session before it was established.
                    (Some(_), AgentEvent::FatalError { message }) => {
                        return Err(SessionError::Signaling(message));
                    }
                    (Some(held), event) => held.push(event),
                    (None, event) => {
                        self.negotiation.post(Step::Event(event));
                    }
                }
                Ok(())
            }
            Routed::Negotiation(message) => self.on_negotiation(message).await,
            Routed::Dropped(_) => Ok(()),
        }
    }

    async fn on_negotiation(&mut self, message: WireMessage) -> Result<(), SessionError> {
        match message {
            WireMessage::Answer { sdp, session_id } => {
                if self.state.has_remote_description() {
                    debug!("Ignoring duplicate answer.");
                    return Ok(());
                }
                self.peer.apply_answer(&sdp).await?;
                self.session_id = session_id;
                let flush = self.state.set_remote_description(sdp);
                debug!(
                    send = flush.send.len(),
                    apply = flush.apply.len(),
                    "Answer applied; flushing queued candidates."
                );
                for candidate in flush.send {
                    self.channel.send(candidate.into()).await?;
                }
                for candidate in flush.apply {
                    self.apply_remote_candidate(candidate).await;
                }
                Ok(())
            }
            WireMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                if let Some(candidate) = self.state.remote_candidate(candidate) {
                    self.apply_remote_candidate(candidate).await;
                }
                Ok(())
            }
            other => {
                warn!(message = ?other, "Ignoring unexpected signaling message.");
                Ok(())
            }
        }
    }

    async fn on_local_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        match self.state.local_candidate(candidate) {
            Some(candidate) => self.channel.send(candidate.into()).await,
            None => Ok(()),
        }
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_remote_candidate(candidate).await {
            warn!(error = %e, "Failed to add remote ICE candidate.");
        }
    }
}
