//! 16-bit PCM frames and the sample conversions around them.

use crate::error::{ReflectaError, Result};

/// A buffer of 16-bit signed mono PCM samples at a fixed sample rate.
///
/// Frames only live while in flight between capture, transport and playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode little-endian 16-bit PCM bytes.
    ///
    /// # Errors
    /// Returns `ReflectaError::Protocol` if the byte count is odd.
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            return Err(ReflectaError::Protocol {
                message: format!("PCM payload has odd length {}", bytes.len()),
            });
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self::new(samples, sample_rate))
    }

    /// Encode as little-endian 16-bit PCM bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert a float sample to int16 using the full signed range.
///
/// The clamp happens before scaling so samples slightly outside [-1, 1]
/// cannot overflow.
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Convert an int16 sample to a float in [-1, 1).
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Mix interleaved multi-channel audio to mono by averaging channels.
pub fn mix_to_mono(samples: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampling of int16 audio.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

/// Linear-interpolation resampling of float audio.
pub fn resample_f32(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = (source_pos - source_idx as f64) as f32;

            match samples.get(source_idx + 1) {
                Some(&right) => {
                    let left = samples[source_idx];
                    left + (right - left) * fraction
                }
                None => samples[source_idx],
            }
        })
        .collect()
}

/// Cuts an arbitrary stream of samples into fixed-size frames.
///
/// Leftover samples wait for the next push; nothing is padded or dropped.
#[derive(Debug, Clone)]
pub struct FrameChunker {
    frame_samples: usize,
    sample_rate: u32,
    pending: Vec<i16>,
}

impl FrameChunker {
    pub fn new(frame_samples: usize, sample_rate: u32) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            sample_rate,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[i16]) -> Vec<PcmFrame> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_samples;
        if complete == 0 {
            return Vec::new();
        }

        let remainder = self.pending.split_off(complete * self.frame_samples);
        let full = std::mem::replace(&mut self.pending, remainder);
        full.chunks_exact(self.frame_samples)
            .map(|chunk| PcmFrame::new(chunk.to_vec(), self.sample_rate))
            .collect()
    }
}
