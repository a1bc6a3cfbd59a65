//! Session-setup message exchange with the remote agent.
//!
//! - `ws`: a persistent WebSocket carrying every wire message both ways.
//! - `http`: the agent's HTTP offer endpoint (`POST`/`PATCH /offer`).
//!
//! [`NegotiationState`] holds the offer/answer pair and the trickle-ICE
//! candidate queues while a transport is being negotiated.

pub mod http;
pub mod ws;

use crate::{
    config::ConnectionConfig,
    error::SessionError,
    protocol::{IceCandidate, WireMessage},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An open signaling channel. `close` is idempotent.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: WireMessage) -> Result<(), SessionError>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// An opened channel and the raw text frames it receives. The receiver ends
/// when the channel closes.
pub struct SignalingLink {
    pub channel: Arc<dyn SignalingChannel>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens a signaling channel for one connection attempt.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> Result<SignalingLink, SessionError>;
}

/// Picks WebSocket or HTTP offer signaling from the endpoint's URL scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndpointSignaling;

#[async_trait]
impl SignalingConnector for EndpointSignaling {
    async fn open(&self, config: &ConnectionConfig) -> Result<SignalingLink, SessionError> {
        let scheme = config
            .endpoint_url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "ws" | "wss" => ws::open(config).await,
            "http" | "https" => http::open(config),
            _ => Err(SessionError::Signaling(format!(
                "unsupported signaling endpoint '{}'",
                config.endpoint_url
            ))),
        }
    }
}

/// Work released by a description becoming known.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Flush {
    /// Local candidates that may now be sent to the agent.
    pub send: Vec<IceCandidate>,
    /// Remote candidates that may now be applied to the transport.
    pub apply: Vec<IceCandidate>,
}

/// Offer/answer state plus the candidates that arrived too early.
///
/// Local candidates are held until the remote description is known; remote
/// candidates are held until both descriptions are set.
#[derive(Debug, Default)]
pub struct NegotiationState {
    local_description: Option<String>,
    remote_description: Option<String>,
    pending_local: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
}

impl NegotiationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_description(&mut self, sdp: String) -> Flush {
        self.local_description = Some(sdp);
        self.flush()
    }

    pub fn set_remote_description(&mut self, sdp: String) -> Flush {
        self.remote_description = Some(sdp);
        self.flush()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    /// Returns the candidate back if it can be sent right away.
    pub fn local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description.is_some() {
            Some(candidate)
        } else {
            self.pending_local.push(candidate);
            None
        }
    }

    /// Returns the candidate back if it can be applied right away.
    pub fn remote_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.local_description.is_some() && self.remote_description.is_some() {
            Some(candidate)
        } else {
            self.pending_remote.push(candidate);
            None
        }
    }

    fn flush(&mut self) -> Flush {
        let mut flush = Flush::default();
        if self.remote_description.is_some() {
            flush.send = std::mem::take(&mut self.pending_local);
            if self.local_description.is_some() {
                flush.apply = std::mem::take(&mut self.pending_remote);
            }
        }
        flush
    }
}
