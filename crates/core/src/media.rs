//! Local audio capture and its binding to the peer transport.

use crate::{
    error::SessionError,
    transport::{PeerTransport, RemoteAudio},
};
use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// A block of mono capture samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// An open capture device.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Releases the device. Must be safe to call more than once and must not
    /// block the calling runtime thread.
    fn stop(&mut self) -> Result<(), SessionError>;
}

/// A capture device together with the frames it produces.
pub struct LocalAudio {
    pub device: Box<dyn CaptureDevice>,
    pub frames: mpsc::Receiver<AudioFrame>,
}

/// Opens the local microphone.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Fails with [`SessionError::DeviceAccess`] when access is denied or no
    /// device exists.
    async fn acquire(&self) -> Result<LocalAudio, SessionError>;
}

/// Receives the inbound audio stream. Rendering is up to the implementation.
pub trait PlaybackSink: Send + Sync {
    fn play(&self, stream: RemoteAudio);
}

#[derive(Default)]
struct MediaSlots {
    device: Option<Box<dyn CaptureDevice>>,
    frames: Option<mpsc::Receiver<AudioFrame>>,
    peer: Option<Arc<dyn PeerTransport>>,
    uplink: Option<JoinHandle<()>>,
    released: bool,
}

/// Owns the capture device and the peer transport of one session.
///
/// `release` frees everything it holds, whether or not a transport was ever
/// attached, and may be called any number of times. Once released, the
/// instance refuses new resources and closes whatever it is handed.
pub struct MediaTransport {
    slots: Mutex<MediaSlots>,
    muted: Arc<AtomicBool>,
    sink: Option<Arc<dyn PlaybackSink>>,
}

impl MediaTransport {
    pub fn new(sink: Option<Arc<dyn PlaybackSink>>) -> Self {
        Self {
            slots: Mutex::new(MediaSlots::default()),
            muted: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    pub async fn acquire_local_audio(&self, source: &dyn AudioSource) -> Result<(), SessionError> {
        let LocalAudio { mut device, frames } = source.acquire().await?;
        let mut slots = self.slots.lock().await;
        if slots.released {
            // Released while the device was being opened.
            if let Err(e) = device.stop() {
                warn!(error = %e, "Failed to stop capture device acquired after release.");
            }
            return Err(SessionError::DeviceAccess(
                "media transport already released".to_string(),
            ));
        }
        info!(device = device.name(), "Local audio acquired.");
        if let Some(mut previous) = slots.device.replace(device) {
            let _ = previous.stop();
        }
        slots.frames = Some(frames);
        Ok(())
    }

    /// Binds the captured audio to `peer` and hands its inbound audio to the
    /// playback sink.
    pub async fn attach(&self, peer: Arc<dyn PeerTransport>) -> Result<(), SessionError> {
        let mut slots = self.slots.lock().await;
        if slots.released {
            drop(slots);
            if let Err(e) = peer.close().await {
                debug!(error = %e, "Closing transport attached after release failed.");
            }
            return Err(SessionError::Transport(
                "media transport already released".to_string(),
            ));
        }
        let Some(mut frames) = slots.frames.take() else {
            // Keep the transport so that `release` still closes it.
            slots.peer = Some(peer);
            return Err(SessionError::DeviceAccess(
                "no local audio acquired".to_string(),
            ));
        };

        let uplink_peer = peer.clone();
        let muted = self.muted.clone();
        slots.uplink = Some(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if muted.load(Ordering::Relaxed) {
                    continue;
                }
                if let Err(e) = uplink_peer.send_audio(frame).await {
                    debug!(error = %e, "Dropping outbound audio frame.");
                }
            }
        }));

        if let Some(remote) = peer.take_remote_audio() {
            match &self.sink {
                Some(sink) => sink.play(remote),
                None => debug!("No playback sink configured; inbound audio is discarded."),
            }
        }
        slots.peer = Some(peer);
        Ok(())
    }

    /// Enables or disables outbound audio. The transport is not renegotiated.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Stops the uplink, frees the capture device and closes the transport.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned for logging.
    pub async fn release(&self) -> Result<(), SessionError> {
        let (uplink, device, peer) = {
            let mut slots = self.slots.lock().await;
            slots.released = true;
            slots.frames = None;
            (slots.uplink.take(), slots.device.take(), slots.peer.take())
        };

        let mut first_error = None;
        if let Some(handle) = uplink {
            handle.abort();
        }
        if let Some(mut device) = device {
            if let Err(e) = device.stop() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
