use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::time::Duration;
use voice_session_core::{AudioFrame, SessionError};

pub const PCMU_SAMPLE_RATE: u32 = 8000;
/// Samples per outbound packet: 20 ms at 8 kHz.
pub const FRAME_SAMPLES: usize = 160;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, SessionError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .map_err(|e| SessionError::Transport(format!("failed to create resampler: {e}")))
}

/// Converts one f32 sample to i16, clamping out-of-range input.
pub fn convert_f32_to_i16(sample: f32) -> i16 {
    (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// G.711 µ-law compression of one linear sample.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if byte & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Decodes a PCMU payload into f32 samples between -1.0 and 1.0.
pub fn decode_pcmu(payload: &[u8]) -> Vec<f32> {
    payload
        .iter()
        .map(|&b| ulaw_to_linear(b) as f32 / 32768.0)
        .collect()
}

/// Turns capture frames of any rate into 20 ms PCMU payloads.
pub struct PcmuEncoder {
    input_rate: u32,
    resampler: Option<FastFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
}

impl Default for PcmuEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PcmuEncoder {
    pub fn new() -> Self {
        Self {
            input_rate: PCMU_SAMPLE_RATE,
            resampler: None,
            pending_in: Vec::new(),
            pending_out: Vec::new(),
        }
    }

    /// Returns every complete payload the frame completes; leftovers are kept
    /// for the next call.
    pub fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<Bytes>, SessionError> {
        if frame.sample_rate != self.input_rate {
            self.reconfigure(frame.sample_rate)?;
        }

        match self.resampler.as_mut() {
            None => self.pending_out.extend_from_slice(&frame.samples),
            Some(resampler) => {
                self.pending_in.extend_from_slice(&frame.samples);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending_in.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.pending_in.drain(..needed).collect();
                    let resampled = resampler
                        .process(&[chunk], None)
                        .map_err(|e| SessionError::Transport(format!("resampling failed: {e}")))?;
                    if let Some(mono) = resampled.into_iter().next() {
                        self.pending_out.extend(mono);
                    }
                }
            }
        }

        let mut payloads = Vec::new();
        while self.pending_out.len() >= FRAME_SAMPLES {
            let payload: Vec<u8> = self
                .pending_out
                .drain(..FRAME_SAMPLES)
                .map(|s| linear_to_ulaw(convert_f32_to_i16(s)))
                .collect();
            payloads.push(Bytes::from(payload));
        }
        Ok(payloads)
    }

    fn reconfigure(&mut self, sample_rate: u32) -> Result<(), SessionError> {
        if sample_rate == 0 {
            return Err(SessionError::Transport(
                "capture frame has no sample rate".to_string(),
            ));
        }
        tracing::debug!(from = self.input_rate, to = sample_rate, "Reconfiguring PCMU encoder.");
        self.input_rate = sample_rate;
        self.pending_in.clear();
        self.pending_out.clear();
        self.resampler = if sample_rate == PCMU_SAMPLE_RATE {
            None
        } else {
            // One 20 ms capture frame per chunk.
            let chunk = (sample_rate as usize / 50).max(1);
            Some(create_resampler(
                f64::from(sample_rate),
                f64::from(PCMU_SAMPLE_RATE),
                chunk,
            )?)
        };
        Ok(())
    }
}
