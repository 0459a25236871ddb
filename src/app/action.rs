//! Action state machine runner
//!
//! Executes pet gestures on a dedicated thread so motion never runs on
//! the main loop. The runner consumes signals from its own channel, the
//! action counterpart of the main event channel.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::app::state::ActionState;

/// Hardware boundary for the pet body
///
/// Implementations are best-effort: failures are logged inside the
/// implementation, never propagated to the caller.
pub trait MotionDriver: Send + Sync {
    /// Perform one gesture; returns when the gesture is underway
    fn perform(&self, action: ActionState);

    /// Immediately stop all motion
    fn halt(&self);
}

/// Signals consumed by the action runner thread
enum ActionSignal {
    /// Execute the given gesture
    Perform(ActionState),
    /// Halt motion and exit the runner
    Exit,
}

/// Dedicated thread driving the [`MotionDriver`]
pub struct ActionRunner {
    tx: Sender<ActionSignal>,
    handle: Option<JoinHandle<()>>,
}

impl ActionRunner {
    /// Spawn the runner thread
    pub fn start(motion: Arc<dyn MotionDriver>) -> Self {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("action".to_string())
            .spawn(move || Self::run(rx, motion))
            .expect("failed to spawn action runner");

        Self {
            tx,
            handle: Some(handle),
        }
    }

    fn run(rx: Receiver<ActionSignal>, motion: Arc<dyn MotionDriver>) {
        for signal in rx.iter() {
            match signal {
                ActionSignal::Perform(ActionState::Stop) => motion.halt(),
                ActionSignal::Perform(action) => {
                    tracing::debug!(%action, "performing gesture");
                    motion.perform(action);
                }
                ActionSignal::Exit => break,
            }
        }
        motion.halt();
    }

    /// Signal a gesture change
    pub fn signal(&self, action: ActionState) {
        let _ = self.tx.send(ActionSignal::Perform(action));
    }

    /// Halt motion and join the runner thread
    pub fn stop(&mut self) {
        let _ = self.tx.send(ActionSignal::Exit);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ActionRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
