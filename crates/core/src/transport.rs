//! Contract for the negotiated peer transport.

use crate::{
    config::ConnectionConfig, error::SessionError, media::AudioFrame, protocol::IceCandidate,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound audio as delivered by the transport, one payload per packet.
pub type RemoteAudio = mpsc::Receiver<Bytes>;

/// Something that happened on the peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered candidate that must be sent to the agent.
    LocalCandidate(IceCandidate),
    /// The transport is ready to carry media.
    Connected,
    /// The transport failed; fatal once connected.
    Failed(String),
    /// The remote side closed the transport.
    Closed,
    /// A text message on the transport's event data channel.
    Message(String),
}

/// A peer connection in the offerer role.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates the local offer and installs it as the local description.
    async fn create_offer(&self) -> Result<String, SessionError>;

    async fn apply_answer(&self, sdp: &str) -> Result<(), SessionError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;

    async fn send_audio(&self, frame: AudioFrame) -> Result<(), SessionError>;

    /// The event stream. Can be taken once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    /// The inbound audio stream. Can be taken once.
    fn take_remote_audio(&self) -> Option<RemoteAudio>;

    /// Closes the transport. Calling it again is a no-op.
    async fn close(&self) -> Result<(), SessionError>;
}

/// Creates a fresh peer transport for each connection attempt.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig)
    -> Result<Arc<dyn PeerTransport>, SessionError>;
}
