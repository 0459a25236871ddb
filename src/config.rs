//! Firmware configuration
//!
//! Sample rates and the frame duration are resolved once at startup;
//! only the decode sample rate may change later, through the decoder
//! reset path.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::{
    frame_samples, CHANNELS, DEFAULT_BITRATE, DEFAULT_DEVICE_SAMPLE_RATE,
    DEFAULT_NETWORK_SAMPLE_RATE, FRAME_DURATION_MS,
};
use crate::error::{Error, Result};

/// Top-level configuration, loadable from a TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub ota: OtaConfig,
    pub protocol: ProtocolConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Audio pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Native sample rate of the audio driver
    pub device_sample_rate: u32,
    /// Sample rate of encoded audio on the wire
    pub network_sample_rate: u32,
    /// Channel count (mono device)
    pub channels: u16,
    /// Frame duration in milliseconds
    pub frame_duration_ms: u32,
    /// Opus bitrate in bits per second
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_sample_rate: DEFAULT_DEVICE_SAMPLE_RATE,
            network_sample_rate: DEFAULT_NETWORK_SAMPLE_RATE,
            channels: CHANNELS,
            frame_duration_ms: FRAME_DURATION_MS,
            bitrate: DEFAULT_BITRATE,
        }
    }
}

impl AudioConfig {
    /// Samples per channel in one driver-rate frame
    pub fn device_frame_samples(&self) -> usize {
        frame_samples(self.device_sample_rate)
    }

    /// Samples per channel in one network-rate frame
    pub fn network_frame_samples(&self) -> usize {
        frame_samples(self.network_sample_rate)
    }
}

/// Over-the-air upgrade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Whether periodic version checks run at all
    pub enabled: bool,
    /// Seconds between version checks
    pub check_interval_secs: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 3600,
        }
    }
}

/// Protocol client configuration (consumed by the concrete client)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Server endpoint the protocol client connects to
    pub server_url: String,
}

/// Opus codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpusConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bitrate in bits per second
    pub bitrate: u32,
    /// Frame size in samples per channel
    pub frame_size: usize,
    /// Variable bitrate
    pub vbr: bool,
    /// In-band forward error correction
    pub fec: bool,
    /// Expected packet loss percentage when FEC is enabled
    pub packet_loss_perc: u8,
}

impl OpusConfig {
    /// Configuration tuned for speech
    pub fn voice(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bitrate: DEFAULT_BITRATE,
            frame_size: Self::frame_size_from_ms(sample_rate, FRAME_DURATION_MS),
            vbr: true,
            fec: true,
            packet_loss_perc: 10,
        }
    }

    /// Frame size in samples per channel for a duration in milliseconds
    pub fn frame_size_from_ms(sample_rate: u32, duration_ms: u32) -> usize {
        (sample_rate as usize * duration_ms as usize) / 1000
    }

    /// Frame duration in milliseconds
    pub fn frame_duration_ms(&self) -> u32 {
        (self.frame_size * 1000 / self.sample_rate as usize) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.device_sample_rate, 48_000);
        assert_eq!(config.audio.network_sample_rate, 16_000);
        assert_eq!(config.audio.frame_duration_ms, 60);
        assert_eq!(config.audio.device_frame_samples(), 2880);
        assert_eq!(config.audio.network_frame_samples(), 960);
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            [audio]
            device_sample_rate = 24000

            [ota]
            check_interval_secs = 120
        "#;
        let config: AppConfig = toml::from_str(text).unwrap();
        assert_eq!(config.audio.device_sample_rate, 24_000);
        assert_eq!(config.audio.network_sample_rate, 16_000);
        assert_eq!(config.ota.check_interval_secs, 120);
        assert!(config.ota.enabled);
    }

    #[test]
    fn test_opus_voice_config() {
        let config = OpusConfig::voice(16_000, 1);
        assert_eq!(config.frame_size, 960);
        assert_eq!(config.frame_duration_ms(), 60);
    }
}
