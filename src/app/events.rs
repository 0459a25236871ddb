//! Main-loop event signaling
//!
//! Typed replacement for a raw event-group bitmask: every signal source
//! posts a discrete [`MainEvent`] onto one bounded channel, and the main
//! loop blocks on it, draining all pending events on each wake.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Capacity of the main event channel. Events are wake-up signals, not
/// data; duplicates collapse on drain, so a full channel loses nothing.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Wake-up signals for the application main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainEvent {
    /// Scheduled-task queue has pending entries
    ScheduleReady,
    /// The audio driver assembled at least one input frame
    AudioInputReady,
    /// The audio driver consumed playback data
    AudioOutputReady,
    /// Exit the main loop
    Shutdown,
}

/// Cloneable posting side of the main event channel
///
/// Handed to the audio driver and to anything that schedules work;
/// posting never blocks.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<MainEvent>,
}

impl EventBus {
    /// Create the event channel, returning the bus and the receive side
    pub fn channel() -> (Self, Receiver<MainEvent>) {
        let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn notify_schedule(&self) {
        self.post(MainEvent::ScheduleReady);
    }

    pub fn notify_audio_input_ready(&self) {
        self.post(MainEvent::AudioInputReady);
    }

    pub fn notify_audio_output_ready(&self) {
        self.post(MainEvent::AudioOutputReady);
    }

    pub fn shutdown(&self) {
        self.post(MainEvent::Shutdown);
    }

    fn post(&self, event: MainEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!(?event, "main loop gone, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_and_drain() {
        let (bus, rx) = EventBus::channel();
        bus.notify_schedule();
        bus.notify_audio_input_ready();
        bus.notify_schedule();

        let drained: Vec<MainEvent> = rx.try_iter().collect();
        assert_eq!(
            drained,
            vec![
                MainEvent::ScheduleReady,
                MainEvent::AudioInputReady,
                MainEvent::ScheduleReady,
            ]
        );
    }

    #[test]
    fn test_full_channel_does_not_block() {
        let (bus, rx) = EventBus::channel();
        for _ in 0..EVENT_CHANNEL_CAPACITY * 2 {
            bus.notify_audio_output_ready();
        }
        assert_eq!(rx.len(), EVENT_CHANNEL_CAPACITY);
    }
}
