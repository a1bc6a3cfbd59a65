//! Signaling through the agent's HTTP offer endpoint.
//!
//! `POST` carries the offer and returns the answer together with the agent's
//! peer-connection id; trickled candidates follow with `PATCH` on the same
//! endpoint. Conversational events do not travel here: they arrive over the
//! transport's data channel.

use super::{SignalingChannel, SignalingLink};
use crate::{
    config::ConnectionConfig,
    error::SessionError,
    protocol::{IceCandidate, WireMessage},
};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

#[derive(Serialize, Debug)]
struct OfferRequest<'a> {
    sdp: &'a str,
    r#type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pc_id: Option<&'a str>,
    restart_pc: bool,
}

#[derive(Deserialize, Debug)]
struct OfferResponse {
    sdp: String,
    #[serde(default)]
    pc_id: Option<String>,
}

#[derive(Serialize, Debug)]
struct CandidatePatch<'a> {
    pc_id: &'a str,
    candidates: Vec<IceCandidate>,
}

struct HttpOfferChannel {
    client: reqwest::Client,
    url: String,
    credential_key: Option<SecretString>,
    pc_id: Mutex<Option<String>>,
    inbound: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: AtomicBool,
}

/// Prepares HTTP offer signaling. No request is made until the offer is sent.
pub fn open(config: &ConnectionConfig) -> Result<SignalingLink, SessionError> {
    let client = reqwest::Client::builder()
        .timeout(config.negotiation_timeout)
        .build()
        .map_err(|e| SessionError::Signaling(e.to_string()))?;
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let channel = HttpOfferChannel {
        client,
        url: config.endpoint_url.clone(),
        credential_key: config
            .credential_key
            .as_ref()
            .map(|k| SecretString::from(k.expose_secret().to_string())),
        pc_id: Mutex::new(None),
        inbound: std::sync::Mutex::new(Some(inbound_tx)),
        closed: AtomicBool::new(false),
    };
    Ok(SignalingLink {
        channel: Arc::new(channel),
        inbound: inbound_rx,
    })
}

impl HttpOfferChannel {
    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credential_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    fn deliver(&self, message: WireMessage) -> Result<(), SessionError> {
        let text = message.encode()?;
        let inbound = self
            .inbound
            .lock()
            .map_err(|_| SessionError::Signaling("inbound queue poisoned".to_string()))?;
        match inbound.as_ref() {
            Some(tx) if tx.send(text).is_ok() => Ok(()),
            _ => Err(SessionError::Signaling("channel is closed".to_string())),
        }
    }

    async fn post_offer(&self, sdp: &str) -> Result<(), SessionError> {
        let pc_id = self.pc_id.lock().await.clone();
        let body = OfferRequest {
            sdp,
            r#type: "offer",
            pc_id: pc_id.as_deref(),
            restart_pc: false,
        };
        let response: OfferResponse = self
            .request(self.client.post(&self.url))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SessionError::Signaling(format!("offer rejected: {e}")))?
            .json()
            .await
            .map_err(|e| SessionError::Signaling(format!("malformed answer: {e}")))?;

        info!(pc_id = ?response.pc_id, "Received answer from offer endpoint.");
        *self.pc_id.lock().await = response.pc_id.clone();
        self.deliver(WireMessage::Answer {
            sdp: response.sdp,
            session_id: response.pc_id,
        })
    }

    async fn patch_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let pc_id = self.pc_id.lock().await.clone().ok_or_else(|| {
            SessionError::Signaling("candidate sent before the agent assigned a pc_id".to_string())
        })?;
        let body = CandidatePatch {
            pc_id: &pc_id,
            candidates: vec![candidate],
        };
        self.request(self.client.patch(&self.url))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SessionError::Signaling(format!("candidate rejected: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for HttpOfferChannel {
    async fn send(&self, message: WireMessage) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Signaling("channel is closed".to_string()));
        }
        match message {
            WireMessage::Offer { sdp } => self.post_offer(&sdp).await,
            WireMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.patch_candidate(IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                })
                .await
            }
            other => Err(SessionError::Signaling(format!(
                "cannot send {other:?} over HTTP offer signaling"
            ))),
        }
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing HTTP offer signaling.");
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.take();
        }
        Ok(())
    }
}
