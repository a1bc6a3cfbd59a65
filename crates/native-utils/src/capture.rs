//! Microphone capture through cpal.
//!
//! cpal streams are not `Send`, so each capture lives on its own thread that
//! builds the stream, reports whether that worked, and then parks until the
//! device is stopped.

use async_trait::async_trait;
use cpal::{
    SampleFormat, StreamConfig,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer},
};
use std::{sync::mpsc as std_mpsc, thread};
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
};
use tracing::{debug, error, info, warn};
use voice_session_core::{AudioFrame, AudioSource, CaptureDevice, LocalAudio, SessionError};

pub const FRAME_DURATION_MS: usize = 20;
/// About one second of audio.
const FRAME_QUEUE: usize = 50;

/// Opens the default (or a named) input device.
#[derive(Debug, Default, Clone)]
pub struct CpalAudioSource {
    device_name: Option<String>,
}

impl CpalAudioSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }
}

#[async_trait]
impl AudioSource for CpalAudioSource {
    async fn acquire(&self) -> Result<LocalAudio, SessionError> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let wanted = self.device_name.clone();

        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture(wanted, frames_tx, ready_tx, stop_rx))
            .map_err(|e| SessionError::DeviceAccess(format!("failed to start capture thread: {e}")))?;

        let name = ready_rx.await.map_err(|_| {
            SessionError::DeviceAccess("capture thread exited before reporting".to_string())
        })??;

        Ok(LocalAudio {
            device: Box::new(CpalCapture {
                name,
                stop: Some(stop_tx),
                thread: Some(thread),
            }),
            frames: frames_rx,
        })
    }
}

/// Names of the input devices on the default host.
pub fn input_device_names() -> Result<Vec<String>, SessionError> {
    let host = cpal::default_host();
    let devices = host.input_devices().map_err(device_error)?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

struct CpalCapture {
    name: String,
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureDevice for CpalCapture {
    fn name(&self) -> &str {
        &self.name
    }

    /// Signals the capture thread to drop its stream. Inside a tokio runtime
    /// the thread is joined on the blocking pool; otherwise it is joined here.
    fn stop(&mut self) -> Result<(), SessionError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let name = self.name.clone();
            match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || {
                        if let Err(e) = join_capture(thread, &name) {
                            warn!(error = %e, "Capture thread did not shut down cleanly.");
                        }
                    });
                }
                Err(_) => join_capture(thread, &name)?,
            }
        }
        Ok(())
    }
}

fn join_capture(thread: thread::JoinHandle<()>, name: &str) -> Result<(), SessionError> {
    thread
        .join()
        .map_err(|_| SessionError::DeviceAccess("capture thread panicked".to_string()))?;
    debug!(device = %name, "Capture device released.");
    Ok(())
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Failed to release capture device.");
        }
    }
}

fn device_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::DeviceAccess(e.to_string())
}

fn run_capture(
    wanted: Option<String>,
    frames: mpsc::Sender<AudioFrame>,
    ready: oneshot::Sender<Result<String, SessionError>>,
    stop: std_mpsc::Receiver<()>,
) {
    let (name, stream) = match open_stream(wanted.as_deref(), frames) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(name)).is_err() {
        return;
    }
    // Returns on stop() or when the capture handle is dropped.
    let _ = stop.recv();
    drop(stream);
}

fn open_stream(
    wanted: Option<&str>,
    frames: mpsc::Sender<AudioFrame>,
) -> Result<(String, cpal::Stream), SessionError> {
    let host = cpal::default_host();
    let device = match wanted {
        Some(wanted) => host
            .input_devices()
            .map_err(device_error)?
            .find(|d| d.name().is_ok_and(|n| n == wanted))
            .ok_or_else(|| {
                SessionError::DeviceAccess(format!("input device '{wanted}' not found"))
            })?,
        None => host
            .default_input_device()
            .ok_or_else(|| SessionError::DeviceAccess("no input device available".to_string()))?,
    };
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device.default_input_config().map_err(device_error)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let mut framer = Framer::new(config.sample_rate.0, config.channels);
    let on_error = |e: cpal::StreamError| error!(error = %e, "Audio capture stream error.");

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                framer.push(data.iter().copied(), &frames)
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                framer.push(data.iter().map(|&s| s as f32 / 32768.0), &frames)
            },
            on_error,
            None,
        ),
        other => {
            return Err(SessionError::DeviceAccess(format!(
                "unsupported sample format {other:?}"
            )));
        }
    }
    .map_err(device_error)?;
    stream.play().map_err(device_error)?;

    info!(
        device = %name,
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "Audio capture started."
    );
    Ok((name, stream))
}

/// Down-mixes interleaved samples to mono and cuts them into fixed frames.
///
/// Runs inside the audio callback, so a full frame queue drops the frame
/// instead of blocking.
pub struct Framer {
    ring: HeapRb<f32>,
    frame_len: usize,
    channels: usize,
    sample_rate: u32,
    acc: f32,
    acc_count: usize,
    dropped: u64,
}

impl Framer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let frame_len = (sample_rate as usize * FRAME_DURATION_MS / 1000).max(1);
        Self {
            ring: HeapRb::new(frame_len),
            frame_len,
            channels: usize::from(channels.max(1)),
            sample_rate,
            acc: 0.0,
            acc_count: 0,
            dropped: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Frames discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, interleaved: impl IntoIterator<Item = f32>, out: &mpsc::Sender<AudioFrame>) {
        for sample in interleaved {
            self.acc += sample;
            self.acc_count += 1;
            if self.acc_count < self.channels {
                continue;
            }
            let mono = self.acc / self.channels as f32;
            self.acc = 0.0;
            self.acc_count = 0;

            // The ring holds one frame and is drained as soon as it fills.
            let _ = self.ring.try_push(mono);
            if self.ring.is_full() {
                self.emit(out);
            }
        }
    }

    fn emit(&mut self, out: &mpsc::Sender<AudioFrame>) {
        let mut samples = vec![0.0; self.frame_len];
        let n = self.ring.pop_slice(&mut samples);
        samples.truncate(n);
        let frame = AudioFrame {
            samples,
            sample_rate: self.sample_rate,
        };
        match out.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                if self.dropped.is_power_of_two() {
                    warn!(dropped = self.dropped, "Capture consumer is lagging; dropping audio frames.");
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
