//! Audio driver trait
//!
//! Raw PCM frame source/sink with a fixed 60 ms frame duration and a
//! configurable native sample rate. Implementations post readiness
//! events instead of calling into application logic.

use crate::app::events::EventBus;
use crate::audio::frame::AudioFrame;
use crate::error::AudioError;

/// Hardware boundary for microphone and speaker
pub trait AudioDriver: Send {
    /// Start capture and playback streams
    ///
    /// The driver posts `AudioInputReady` whenever a full input frame is
    /// assembled and `AudioOutputReady` as playback consumes data.
    fn start(&mut self, events: EventBus) -> Result<(), AudioError>;

    /// Take one assembled 60 ms input frame, if one is ready
    ///
    /// Never blocks. Frames arrive at the driver's native sample rate.
    fn read(&mut self) -> Option<AudioFrame>;

    /// Queue playback samples at the driver's native sample rate
    fn write(&mut self, samples: &[f32]) -> Result<(), AudioError>;

    /// Drop any queued playback samples (speaking abort)
    fn flush_output(&mut self);

    /// Native sample rate of both directions
    fn sample_rate(&self) -> u32;

    /// Stop both streams
    fn stop(&mut self);
}
