//! Audio driver boundary
//!
//! Fixed-duration mono PCM frames in and out of the hardware, plus the
//! wake-word front end that consumes idle-path microphone audio.

pub mod driver;
pub mod frame;
pub mod host;

pub use driver::AudioDriver;
pub use frame::{AudioFrame, FrameAssembler, FrameRing, SharedFrameRing};
pub use host::CpalDriver;

/// Wake-word detector front end (external collaborator)
///
/// Receives device-rate microphone frames whenever the device is not
/// listening. Detection results come back through
/// `Application::on_wake_word_detected`, wired up by the host.
pub trait WakeWordDetector: Send + Sync {
    fn feed(&self, samples: &[f32]);
}
