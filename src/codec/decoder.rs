//! Opus decoder wrapper
//!
//! Decodes server speech frames at the negotiated sample rate, with
//! packet loss concealment for dropped frames.

use opus::{Channels, Decoder};

use crate::config::OpusConfig;
use crate::error::CodecError;

/// Opus decoder wrapper for the playback path
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    frame_size: usize,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<f32>,
    /// Frames decoded
    frames_decoded: u64,
    /// Frames lost (PLC used)
    frames_lost: u64,
}

impl OpusDecoder {
    /// Create a new Opus decoder for the given sample rate
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        let frame_size = OpusConfig::frame_size_from_ms(sample_rate, crate::constants::FRAME_DURATION_MS);

        // Pre-allocate decoding buffer for the largest Opus frame
        // (120 ms at 48 kHz stereo)
        let decode_buffer = vec![0.0f32; 48_000 * 2 * 120 / 1000];

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            frame_size,
            decode_buffer,
            frames_decoded: 0,
            frames_lost: 0,
        })
    }

    /// Decode one Opus packet to interleaved f32 samples
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        let total_samples = samples * self.channels as usize;
        self.frames_decoded += 1;

        Ok(self.decode_buffer[..total_samples].to_vec())
    }

    /// Generate packet loss concealment samples for a lost frame
    pub fn decode_plc(&mut self) -> Result<Vec<f32>, CodecError> {
        let samples = self
            .decoder
            .decode_float(&[], &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        let total_samples = samples * self.channels as usize;
        self.frames_lost += 1;

        Ok(self.decode_buffer[..total_samples].to_vec())
    }

    /// Reset decoder state
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    /// Get sample rate
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Get channel count
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Get frame size in samples (per channel)
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_lost: self.frames_lost,
        }
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
}
