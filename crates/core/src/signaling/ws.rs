//! WebSocket signaling: every wire message travels as one JSON text frame.

use super::{SignalingChannel, SignalingLink};
use crate::{config::ConnectionConfig, error::SessionError, protocol::WireMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use secrecy::ExposeSecret;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct WsChannel {
    sink: Mutex<WsSink>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Connects to the agent's signaling WebSocket.
pub async fn open(config: &ConnectionConfig) -> Result<SignalingLink, SessionError> {
    let mut request = config
        .endpoint_url
        .as_str()
        .into_client_request()
        .map_err(|e| SessionError::Signaling(format!("invalid signaling url: {e}")))?;
    if let Some(key) = &config.credential_key {
        let value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
            .map_err(|e| SessionError::Signaling(format!("invalid credential key: {e}")))?;
        request.headers_mut().insert("Authorization", value);
    }

    let (ws_stream, _) = connect_async(request)
        .await
        .map_err(|e| SessionError::Signaling(format!("failed to connect: {e}")))?;
    let (ws_tx, mut ws_rx) = ws_stream.split();
    info!(endpoint = %config.endpoint_url, "Connected to signaling WebSocket.");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(async move {
        while let Some(msg_result) = ws_rx.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "Signaling WebSocket closed by agent.");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Error reading from signaling WebSocket.");
                    break;
                }
            }
        }
    });

    let channel = WsChannel {
        sink: Mutex::new(ws_tx),
        reader: std::sync::Mutex::new(Some(reader)),
        closed: AtomicBool::new(false),
    };
    Ok(SignalingLink {
        channel: Arc::new(channel),
        inbound: inbound_rx,
    })
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn send(&self, message: WireMessage) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Signaling("channel is closed".to_string()));
        }
        let text = message.encode()?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
        debug!("Closing signaling WebSocket.");
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| SessionError::Signaling(e.to_string()))
    }
}
