//! # Voicepet Firmware Core
//!
//! Coordinator and audio pipeline for a voice-interactive pet companion
//! device: a small robot with a microphone, a speaker, a monochrome
//! display and a handful of motion gestures.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Application                              │
//! │                                                                  │
//! │  Microphone ──► input resampler ──► Opus encoder ──► protocol    │
//! │   (driver)       (device→network)   (BackgroundTask)   send      │
//! │                                                                  │
//! │  protocol ──► decode queue ──► Opus decoder ──► output resampler │
//! │   receive       (FIFO)         (BackgroundTask)  ──► speaker     │
//! │                                                                  │
//! │  Main loop: blocks on a typed event channel                      │
//! │    ScheduleReady → drain scheduled tasks (FIFO)                  │
//! │    AudioInputReady → input_audio()                               │
//! │    AudioOutputReady → output_audio()                             │
//! │                                                                  │
//! │  Collaborators: Display, OtaUpdater, MotionDriver,               │
//! │                 WakeWordDetector, ProtocolClient                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrency is bounded and enumerable: the main loop thread, one
//! background worker for codec work, the action runner, an OTA timer
//! thread, and driver/protocol callback contexts that only post events
//! or call thread-safe [`app::Application`] methods.

pub mod app;
pub mod audio;
pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod ota;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Protocol frame duration in milliseconds
    pub const FRAME_DURATION_MS: u32 = 60;

    /// Default native sample rate of the audio driver
    pub const DEFAULT_DEVICE_SAMPLE_RATE: u32 = 48_000;

    /// Sample rate of encoded audio sent to the network
    pub const DEFAULT_NETWORK_SAMPLE_RATE: u32 = 16_000;

    /// Channel count (the device is mono end to end)
    pub const CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second (voice)
    pub const DEFAULT_BITRATE: u32 = 24_000;

    /// Maximum outstanding background jobs
    pub const BACKGROUND_QUEUE_CAPACITY: usize = 64;

    /// Driver-side frame ring buffer capacity (in frames)
    pub const RING_BUFFER_CAPACITY: usize = 8;

    /// Samples per channel in one frame at the given rate
    pub const fn frame_samples(sample_rate: u32) -> usize {
        (sample_rate as usize * FRAME_DURATION_MS as usize) / 1000
    }
}
