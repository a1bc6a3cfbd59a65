use crate::audio::{FRAME_DURATION, PCMU_SAMPLE_RATE, PcmuEncoder};
use async_trait::async_trait;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use voice_session_core::{
    AudioFrame, ConnectionConfig, IceCandidate, PeerConnector, PeerEvent, PeerTransport,
    RemoteAudio, SessionError,
};
use webrtc::{
    api::{
        APIBuilder,
        interceptor_registry::register_default_interceptors,
        media_engine::{MIME_TYPE_PCMU, MediaEngine},
    },
    data_channel::{RTCDataChannel, data_channel_message::DataChannelMessage},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp_transceiver::{
        RTCRtpTransceiver,
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
    },
    track::{
        track_local::{TrackLocal, track_local_static_sample::TrackLocalStaticSample},
        track_remote::TrackRemote,
    },
};

/// Label of the data channel that carries conversational events.
pub const EVENTS_CHANNEL: &str = "events";
const REMOTE_AUDIO_QUEUE: usize = 64;

fn transport_error(e: webrtc::Error) -> SessionError {
    SessionError::Transport(e.to_string())
}

/// Creates a [`WebRtcPeer`] per connection attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcConnector;

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn PeerTransport>, SessionError> {
        let peer = WebRtcPeer::new(&config.ice_servers).await?;
        Ok(Arc::new(peer))
    }
}

/// One WebRTC peer connection with a PCMU audio track and an event channel.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    encoder: Mutex<PcmuEncoder>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    remote_audio: Mutex<Option<RemoteAudio>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    pub async fn new(ice_servers: &[String]) -> Result<Self, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(transport_error)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(REMOTE_AUDIO_QUEUE);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: PCMU_SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "voice-client".to_owned(),
        ));
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(transport_error)?;
        // RTCP has to be drained for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let channel = pc
            .create_data_channel(EVENTS_CHANNEL, None)
            .await
            .map_err(transport_error)?;
        forward_messages(&channel, events_tx.clone());

        let tx = events_tx.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            debug!(label = channel.label(), "Agent opened a data channel.");
            forward_messages(&channel, tx.clone());
            Box::pin(async {})
        }));

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete.");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate."),
                }
            })
        }));

        let tx = events_tx;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!(?state, "Peer connection state changed.");
            if let Some(event) = peer_event_for(state) {
                let _ = tx.send(event);
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let audio_tx = audio_tx.clone();
                Box::pin(async move {
                    if track.kind() == RTPCodecType::Audio {
                        info!(
                            codec = %track.codec().capability.mime_type,
                            "Remote audio track received."
                        );
                        tokio::spawn(read_remote_audio(track, audio_tx));
                    }
                })
            },
        ));

        Ok(Self {
            pc,
            track,
            encoder: Mutex::new(PcmuEncoder::new()),
            events: Mutex::new(Some(events_rx)),
            remote_audio: Mutex::new(Some(audio_rx)),
            closed: AtomicBool::new(false),
        })
    }
}

/// Maps connection states the session cares about.
pub fn peer_event_for(state: RTCPeerConnectionState) -> Option<PeerEvent> {
    match state {
        RTCPeerConnectionState::Connected => Some(PeerEvent::Connected),
        RTCPeerConnectionState::Failed => {
            Some(PeerEvent::Failed("peer connection failed".to_string()))
        }
        RTCPeerConnectionState::Closed => Some(PeerEvent::Closed),
        _ => None,
    }
}

fn forward_messages(channel: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!(len = msg.data.len(), "Ignoring binary data channel message.");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = events.send(PeerEvent::Message(text));
                }
                Err(e) => warn!(error = %e, "Dropping non UTF-8 data channel message."),
            }
        })
    }));
}

async fn read_remote_audio(track: Arc<TrackRemote>, audio: mpsc::Sender<bytes::Bytes>) {
    let mut dropped = 0u64;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                match audio.try_send(packet.payload) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped.is_power_of_two() {
                            debug!(dropped, "Playback is lagging; dropping inbound audio.");
                        }
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                debug!(error = %e, "Remote audio track ended.");
                break;
            }
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, SessionError> {
        let offer = self.pc.create_offer(None).await.map_err(transport_error)?;
        // Starts ICE gathering; candidates arrive through on_ice_candidate.
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(transport_error)?;
        Ok(offer.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), SessionError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned()).map_err(transport_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(transport_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(transport_error)
    }

    async fn send_audio(&self, frame: AudioFrame) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Transport("peer connection is closed".to_string()));
        }
        let payloads = {
            let mut encoder = self
                .encoder
                .lock()
                .map_err(|_| SessionError::Transport("audio encoder poisoned".to_string()))?;
            encoder.encode(&frame)?
        };
        for data in payloads {
            self.track
                .write_sample(&Sample {
                    data,
                    duration: FRAME_DURATION,
                    ..Default::default()
                })
                .await
                .map_err(transport_error)?;
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().ok()?.take()
    }

    fn take_remote_audio(&self) -> Option<RemoteAudio> {
        self.remote_audio.lock().ok()?.take()
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Closing peer connection.");
        self.pc.close().await.map_err(transport_error)
    }
}
