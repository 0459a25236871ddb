//! Opus encoder wrapper
//!
//! Voice-tuned Opus encoding of fixed-duration microphone frames.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::config::OpusConfig;
use crate::error::CodecError;

/// Opus encoder wrapper for the microphone path
pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new Opus encoder with the specified configuration
    pub fn new(config: OpusConfig) -> Result<Self, CodecError> {
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    config.channels
                )))
            }
        };

        let mut encoder = Encoder::new(config.sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &config)?;

        // Pre-allocate encoding buffer (max Opus frame is about 1275 bytes)
        let encode_buffer = vec![0u8; 4000];

        Ok(Self {
            encoder,
            config,
            encode_buffer,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Create an encoder for the device's voice uplink
    pub fn voice(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        Self::new(OpusConfig::voice(sample_rate, channels))
    }

    /// Configure the encoder with all settings
    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| {
                    CodecError::EncoderInit(format!("Failed to set packet loss: {}", e))
                })?;
        }

        Ok(())
    }

    /// Encode one frame of audio samples to Opus
    ///
    /// Input must be interleaved f32 samples with length = frame_size * channels
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        let expected_len = self.config.frame_size * self.config.channels as usize;
        if samples.len() != expected_len {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let size = self
            .encoder
            .encode_float(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Reset the internal codec state
    ///
    /// Used when a new listening turn starts so the first frame of a turn
    /// never carries prediction state from the previous one.
    pub fn reset(&mut self) -> Result<(), CodecError> {
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncoderInit(e.to_string()))
    }

    /// Get current configuration
    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    /// Get expected frame size in samples (per channel)
    pub fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    /// Get expected total samples per frame (including all channels)
    pub fn samples_per_frame(&self) -> usize {
        self.config.frame_size * self.config.channels as usize
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
}
