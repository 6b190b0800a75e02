use crate::error::{VoiceError, VoiceResult};
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, warn};

/// Input block size handed to the resampler.
pub const RESAMPLER_CHUNK: usize = 1024;

/// Creates a mono resampler converting between two sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> VoiceResult<FastFixedIn<f32>> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .map_err(|e| {
        VoiceError::UnsupportedEnvironment(format!(
            "cannot resample {in_sampling_rate} Hz to {out_sampling_rate} Hz: {e}"
        ))
    })
}

/// Resampler for audio that arrives in arbitrarily sized pieces.
///
/// Input is buffered until a full resampler block is available. When both
/// rates are equal samples pass through untouched.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> VoiceResult<Self> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(in_rate as f64, out_rate as f64, RESAMPLER_CHUNK)?)
        };
        Ok(Self {
            resampler,
            ratio: out_rate as f64 / in_rate as f64,
            pending: Vec::new(),
        })
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return input.to_vec();
        };
        self.pending.extend_from_slice(input);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(std::slice::from_ref(&block), None) {
                Ok(mut channels) => out.append(&mut channels[0]),
                Err(e) => {
                    warn!(error = %e, "Resampler rejected block; dropping it");
                    break;
                }
            }
        }
        out
    }

    /// Resamples whatever is still buffered, padding the final block.
    pub fn flush(&mut self) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Vec::new();
        };
        if self.pending.is_empty() {
            return Vec::new();
        }
        let expected = (self.pending.len() as f64 * self.ratio).round() as usize;
        let block = std::mem::take(&mut self.pending);
        match resampler.process_partial(Some(std::slice::from_ref(&block)), None) {
            Ok(mut channels) => {
                let mut out = std::mem::take(&mut channels[0]);
                out.truncate(expected);
                out
            }
            Err(e) => {
                warn!(error = %e, "Resampler failed to flush");
                Vec::new()
            }
        }
    }
}

/// Decodes base64 PCM16 little-endian audio into normalized f32 samples.
pub fn decode_f32_from_base64_i16(base64_fragment: &str) -> Vec<f32> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| {
                let v = i16::from_le_bytes([chunk[0], chunk[1]]);
                (v as f32 / 32768.0).clamp(-1.0, 1.0)
            })
            .collect()
    } else {
        error!("Failed to decode base64 audio fragment");
        Vec::new()
    }
}

pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Encodes PCM16 samples as base64 little-endian bytes.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let bytes: Vec<u8> = pcm16.iter().flat_map(|sample| sample.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}
