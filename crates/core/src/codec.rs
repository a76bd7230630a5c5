//! Conversion between normalized f32 samples and the PCM16 wire format.
//!
//! Outbound audio is quantized to little-endian i16 and base64 encoded into a
//! [`WireAudioBlock`]. Inbound blocks decode into a [`PlaybackBuffer`]. Sample
//! rate and channel count are never embedded in the payload; callers supply
//! them (the mime type carries the rate as a hint).

use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use serde::{Deserialize, Serialize};

/// Rate the remote model expects for microphone audio.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Rate the remote model speaks at.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

const PCM16_SCALE: f32 = 32768.0;
/// Input frames the resampler consumes per call.
pub const RESAMPLER_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("audio payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("audio payload of {len} bytes does not hold whole {channels}-channel PCM16 frames")]
    Truncated { len: usize, channels: usize },
    #[error("channel count must be at least 1")]
    NoChannels,
    #[error("resampler error: {0}")]
    Resampler(String),
}

/// One block of encoded audio as it travels over the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAudioBlock {
    pub data: String,
    pub mime_type: String,
}

/// Decoded audio, planar per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl PlaybackBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Averages all channels into one.
    pub fn mixdown(&self) -> Vec<f32> {
        match self.channels.as_slice() {
            [] => Vec::new(),
            [only] => only.clone(),
            many => {
                let count = many.len() as f32;
                (0..self.frames())
                    .map(|i| many.iter().map(|c| c[i]).sum::<f32>() / count)
                    .collect()
            }
        }
    }
}

/// Quantizes one normalized sample, saturating at the i16 range.
pub fn quantize(sample: f32) -> i16 {
    let scaled = (sample * PCM16_SCALE).round();
    if scaled.is_nan() {
        return 0;
    }
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn mime_type_for_rate(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Reads the `rate=` parameter of a PCM mime type such as `audio/pcm;rate=24000`.
pub fn rate_from_mime_type(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Encodes mono samples into a wire block.
pub fn encode(samples: &[f32], sample_rate: u32) -> WireAudioBlock {
    let pcm16: Vec<u8> = samples
        .iter()
        .flat_map(|&sample| quantize(sample).to_le_bytes())
        .collect();
    WireAudioBlock {
        data: base64::engine::general_purpose::STANDARD.encode(&pcm16),
        mime_type: mime_type_for_rate(sample_rate),
    }
}

/// Decodes the raw i16 samples of a block, interleaved as sent.
pub fn decode_i16(data: &str) -> Result<Vec<i16>, CodecError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
    if bytes.len() % 2 != 0 {
        return Err(CodecError::Truncated {
            len: bytes.len(),
            channels: 1,
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Decodes a block into a buffer, de-interleaving `channels` channels.
pub fn decode(
    block: &WireAudioBlock,
    sample_rate: u32,
    channels: usize,
) -> Result<PlaybackBuffer, CodecError> {
    if channels == 0 {
        return Err(CodecError::NoChannels);
    }
    let samples = decode_i16(&block.data)?;
    if samples.len() % channels != 0 {
        return Err(CodecError::Truncated {
            len: samples.len() * 2,
            channels,
        });
    }

    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (channel, &value) in planar.iter_mut().zip(frame) {
            channel.push(value as f32 / PCM16_SCALE);
        }
    }
    Ok(PlaybackBuffer::new(sample_rate, planar))
}

/// Creates a mono resampler between two sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, CodecError> {
    FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )
    .map_err(|e| CodecError::Resampler(e.to_string()))
}

/// Feeds arbitrarily sized input through a fixed-chunk resampler.
///
/// Equal rates pass samples straight through.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, CodecError> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(
                in_rate as f64,
                out_rate as f64,
                RESAMPLER_CHUNK,
            )?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(result) => output.extend_from_slice(&result[0]),
                Err(e) => tracing::warn!(error = %e, "Resampler rejected a chunk"),
            }
        }
        output
    }

    /// Pushes out whatever is still buffered.
    pub fn flush(&mut self) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Vec::new();
        };
        if self.pending.is_empty() {
            return Vec::new();
        }
        let rest = vec![std::mem::take(&mut self.pending)];
        match resampler.process_partial(Some(rest.as_slice()), None) {
            Ok(result) => result.into_iter().next().unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Resampler failed to flush");
                Vec::new()
            }
        }
    }
}

/// Resamples a complete mono buffer in one go.
pub fn resample(samples: &[f32], in_rate: u32, out_rate: u32) -> Result<Vec<f32>, CodecError> {
    let mut resampler = StreamResampler::new(in_rate, out_rate)?;
    let mut output = resampler.process(samples);
    output.extend(resampler.flush());
    Ok(output)
}
