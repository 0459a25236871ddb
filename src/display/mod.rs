//! Display collaborator boundary
//!
//! The animated face and status area are rendered elsewhere; the core
//! only pushes notifications through this trait. Implementations must
//! never block the caller — updates are advisory and best-effort.

use crate::app::state::{ActionState, DeviceState};

/// Sink for everything the device wants shown on its face
pub trait FaceDisplay: Send + Sync {
    /// Device state changed
    fn on_device_state(&self, state: DeviceState);

    /// Gesture changed
    fn on_action_state(&self, action: ActionState);

    /// Short status line ("standby", "listening...", ...)
    fn set_status(&self, text: &str);

    /// One chat utterance; `role` is "user" or "assistant"
    fn set_chat_message(&self, role: &str, text: &str);

    /// Emotion tag driving the eye animation
    fn set_emotion(&self, emotion: &str);

    /// Transient notification text, clears on recovery
    fn show_notification(&self, text: &str);

    /// Persistent, non-dismissible alert (fatal errors)
    fn alert(&self, title: &str, message: &str);
}

/// Log-only display for headless hosts
#[derive(Debug, Default)]
pub struct ConsoleDisplay;

impl FaceDisplay for ConsoleDisplay {
    fn on_device_state(&self, state: DeviceState) {
        tracing::info!(%state, "device state");
    }

    fn on_action_state(&self, action: ActionState) {
        tracing::info!(%action, "action state");
    }

    fn set_status(&self, text: &str) {
        tracing::info!(status = text, "display status");
    }

    fn set_chat_message(&self, role: &str, text: &str) {
        tracing::info!(role, text, "chat");
    }

    fn set_emotion(&self, emotion: &str) {
        tracing::debug!(emotion, "emotion");
    }

    fn show_notification(&self, text: &str) {
        tracing::info!(text, "notification");
    }

    fn alert(&self, title: &str, message: &str) {
        tracing::warn!(title, message, "alert");
    }
}
