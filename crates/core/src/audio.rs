//! Telephony audio frames and the G.711 mu-law codec
//!
//! The carrier media channel speaks mu-law 8 kHz mono in 20 ms payloads
//! (160 bytes). The STT provider consumes mu-law directly; the linear PCM
//! path (decode + upsample to 16 kHz) exists for providers that require it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Supported sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8 kHz - telephony narrow-band
    #[default]
    Hz8000,
    /// 16 kHz - speech recognition
    Hz16000,
}

impl SampleRate {
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
        }
    }

    /// Samples in a 20 ms frame at this rate
    pub fn frame_size_20ms(&self) -> usize {
        (self.as_u32() as usize * 20) / 1000
    }
}

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Encode one 16-bit linear PCM sample as a G.711 mu-law byte.
pub fn mulaw_encode(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80u8
    } else {
        0
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    let mut exponent = 7u8;
    let mut mask = 0x4000;
    while exponent > 0 && (pcm & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Decode one G.711 mu-law byte to a 16-bit linear PCM sample.
pub fn mulaw_decode(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;
    let mut pcm = (((mantissa as i32) << 3) + BIAS) << exponent;
    pcm -= BIAS;
    if sign != 0 {
        (-pcm) as i16
    } else {
        pcm as i16
    }
}

/// A mono audio frame with linear f32 samples in [-1.0, 1.0]
#[derive(Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub sample_rate: SampleRate,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: SampleRate) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Decode a mu-law byte payload into a frame
    pub fn from_mulaw(bytes: &[u8], sample_rate: SampleRate) -> Self {
        let samples: Vec<f32> = bytes
            .iter()
            .map(|&b| mulaw_decode(b) as f32 / 32768.0)
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Encode the frame as mu-law bytes
    pub fn to_mulaw(&self) -> Vec<u8> {
        self.samples
            .iter()
            .map(|&s| {
                let clamped = s.clamp(-1.0, 1.0);
                mulaw_encode((clamped * 32767.0) as i16)
            })
            .collect()
    }

    /// Convert to PCM16 bytes (little-endian)
    pub fn to_pcm16(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|&sample| {
                let clamped = sample.clamp(-1.0, 1.0);
                ((clamped * 32767.0) as i16).to_le_bytes()
            })
            .collect()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.as_u32() as f64)
    }

    /// Resample to a target rate using Rubato's FFT resampler.
    ///
    /// Frames shorter than 64 samples fall back to linear interpolation,
    /// which Rubato handles poorly at these block sizes.
    pub fn resample(&self, target_rate: SampleRate) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target_rate {
            return self.clone();
        }
        if self.samples.len() < 64 {
            return self.resample_linear(target_rate);
        }

        let from_rate = self.sample_rate.as_u32() as usize;
        let to_rate = target_rate.as_u32() as usize;
        let chunk_size = self.samples.len().min(1024);
        let samples_f64: Vec<f64> = self.samples.iter().map(|&s| s as f64).collect();

        match FftFixedIn::<f64>::new(from_rate, to_rate, chunk_size, 2, 1) {
            Ok(mut resampler) => match resampler.process(&[samples_f64], None) {
                Ok(output) => {
                    let resampled: Vec<f32> = output[0].iter().map(|&s| s as f32).collect();
                    Self::new(resampled, target_rate)
                }
                Err(e) => {
                    tracing::warn!("resampler failed, using linear fallback: {}", e);
                    self.resample_linear(target_rate)
                }
            },
            Err(e) => {
                tracing::warn!("resampler init failed, using linear fallback: {}", e);
                self.resample_linear(target_rate)
            }
        }
    }

    fn resample_linear(&self, target_rate: SampleRate) -> Self {
        let ratio = target_rate.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;

        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = (src_idx - idx_floor as f64) as f32;
            resampled.push(self.samples[idx_floor] * (1.0 - frac) + self.samples[idx_ceil] * frac);
        }
        Self::new(resampled, target_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_round_trip_is_close() {
        for &sample in &[0i16, 100, -100, 1000, -1000, 8000, -8000, 30000, -30000] {
            let decoded = mulaw_decode(mulaw_encode(sample));
            // mu-law is lossy; error grows with magnitude but stays small
            // relative to the value
            let error = (decoded as i32 - sample as i32).abs();
            let bound = (sample as i32).abs() / 16 + 64;
            assert!(
                error <= bound,
                "sample {} decoded to {} (error {})",
                sample,
                decoded,
                error
            );
        }
    }

    #[test]
    fn test_mulaw_silence() {
        // mu-law encodes digital silence as 0xFF
        assert_eq!(mulaw_encode(0), 0xFF);
        assert_eq!(mulaw_decode(0xFF), 0);
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(SampleRate::Hz8000.frame_size_20ms(), 160);
        assert_eq!(SampleRate::Hz16000.frame_size_20ms(), 320);
    }

    #[test]
    fn test_frame_mulaw_round_trip_length() {
        let payload = vec![0xFFu8; 160];
        let frame = AudioFrame::from_mulaw(&payload, SampleRate::Hz8000);
        assert_eq!(frame.samples.len(), 160);
        assert_eq!(frame.to_mulaw().len(), 160);
        assert_eq!(frame.duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_resample_upsamples_telephony_audio() {
        let samples = vec![0.1f32; 800]; // 100 ms at 8 kHz
        let frame = AudioFrame::new(samples, SampleRate::Hz8000);
        let upsampled = frame.resample(SampleRate::Hz16000);
        assert_eq!(upsampled.sample_rate, SampleRate::Hz16000);
        assert!((upsampled.samples.len() as i64 - 1600).abs() <= 16);
    }

    #[test]
    fn test_resample_short_frame_linear() {
        let frame = AudioFrame::new(vec![0.5f32; 16], SampleRate::Hz8000);
        let upsampled = frame.resample(SampleRate::Hz16000);
        assert_eq!(upsampled.samples.len(), 32);
    }
}
