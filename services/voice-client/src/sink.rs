//! Inbound agent audio handling for the console client.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::{debug, info};
use voice_session_core::{PlaybackSink, RemoteAudio};
use voice_webrtc_transport::audio::decode_pcmu;

/// Packets between progress logs; 250 PCMU packets are five seconds.
const LOG_EVERY_PACKETS: u64 = 250;

/// Drains the agent's audio and logs its level instead of rendering it.
#[derive(Debug, Default, Clone)]
pub struct LoggingPlaybackSink {
    received: Arc<AtomicU64>,
}

impl LoggingPlaybackSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payload bytes received across all sessions.
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl PlaybackSink for LoggingPlaybackSink {
    fn play(&self, mut stream: RemoteAudio) {
        let received = self.received.clone();
        tokio::spawn(async move {
            let mut packets = 0u64;
            let mut peak = 0.0f32;
            while let Some(payload) = stream.recv().await {
                received.fetch_add(payload.len() as u64, Ordering::Relaxed);
                packets += 1;
                peak = decode_pcmu(&payload)
                    .into_iter()
                    .fold(peak, |acc, s| acc.max(s.abs()));
                if packets % LOG_EVERY_PACKETS == 0 {
                    debug!(packets, peak, "Receiving agent audio.");
                    peak = 0.0;
                }
            }
            info!(packets, "Agent audio stream ended.");
        });
    }
}
