//! Network protocol session boundary
//!
//! The wire format lives outside the core: the coordinator drives a
//! [`ProtocolClient`] and receives inbound traffic through a
//! [`ProtocolListener`]. Listener methods may be called from any thread
//! at any time, including a channel close at any moment.

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ProtocolError;

/// Reason a speaking turn was cancelled, forwarded to the server so it
/// can suppress further inbound audio for the aborted turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    None,
    User,
    WakeWord,
}

/// Listening behavior requested from the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Server ends the turn when the user stops talking
    AutoStop,
    /// Device keeps listening after each reply
    AlwaysOn,
}

/// Inbound traffic sink, implemented by the application coordinator
pub trait ProtocolListener: Send + Sync {
    /// One encoded audio frame of server speech
    fn on_incoming_audio(&self, frame: Bytes);

    /// One JSON state message (hello, tts, stt, llm, goodbye, ...)
    fn on_incoming_json(&self, payload: Value);

    /// The audio channel dropped, whether requested or not
    fn on_audio_channel_closed(&self);
}

/// Session abstraction the coordinator drives
pub trait ProtocolClient: Send + Sync {
    /// Register the listener and start the session machinery
    fn start(&self, listener: Arc<dyn ProtocolListener>) -> Result<(), ProtocolError>;

    /// Open the audio channel; blocking, returns once negotiated
    fn open_audio_channel(&self) -> Result<(), ProtocolError>;

    /// Close the audio channel; triggers `on_audio_channel_closed`
    fn close_audio_channel(&self);

    fn is_audio_channel_opened(&self) -> bool;

    /// Send one encoded microphone frame
    fn send_audio(&self, frame: Bytes) -> Result<(), ProtocolError>;

    fn send_start_listening(&self, mode: ListenMode) -> Result<(), ProtocolError>;

    fn send_stop_listening(&self) -> Result<(), ProtocolError>;

    fn send_abort_speaking(&self, reason: AbortReason) -> Result<(), ProtocolError>;
}

/// In-process echo server for bench testing without a network
///
/// Buffers every frame sent while listening; when listening stops it
/// replays the turn back as server speech wrapped in tts start/stop
/// messages, so the whole capture → encode → decode → playback path can
/// run against it.
pub struct LoopbackProtocol {
    sample_rate: u32,
    opened: AtomicBool,
    listener: Mutex<Option<Arc<dyn ProtocolListener>>>,
    turn: Mutex<Vec<Bytes>>,
}

impl LoopbackProtocol {
    /// `sample_rate` is echoed in the hello message as the negotiated
    /// decode rate
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            opened: AtomicBool::new(false),
            listener: Mutex::new(None),
            turn: Mutex::new(Vec::new()),
        }
    }

    fn listener(&self) -> Option<Arc<dyn ProtocolListener>> {
        self.listener.lock().clone()
    }
}

impl ProtocolClient for LoopbackProtocol {
    fn start(&self, listener: Arc<dyn ProtocolListener>) -> Result<(), ProtocolError> {
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn open_audio_channel(&self) -> Result<(), ProtocolError> {
        let listener = self
            .listener()
            .ok_or_else(|| ProtocolError::ChannelOpenFailed("not started".to_string()))?;
        self.opened.store(true, Ordering::Release);

        listener.on_incoming_json(serde_json::json!({
            "type": "hello",
            "audio_params": { "sample_rate": self.sample_rate },
        }));
        Ok(())
    }

    fn close_audio_channel(&self) {
        if self.opened.swap(false, Ordering::AcqRel) {
            if let Some(listener) = self.listener() {
                listener.on_audio_channel_closed();
            }
        }
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    fn send_audio(&self, frame: Bytes) -> Result<(), ProtocolError> {
        if !self.is_audio_channel_opened() {
            return Err(ProtocolError::ChannelClosed);
        }
        self.turn.lock().push(frame);
        Ok(())
    }

    fn send_start_listening(&self, _mode: ListenMode) -> Result<(), ProtocolError> {
        self.turn.lock().clear();
        Ok(())
    }

    fn send_stop_listening(&self) -> Result<(), ProtocolError> {
        let frames: Vec<Bytes> = std::mem::take(&mut *self.turn.lock());
        let Some(listener) = self.listener() else {
            return Ok(());
        };

        // Replay off-thread so the caller is never blocked on playback
        std::thread::spawn(move || {
            listener.on_incoming_json(serde_json::json!({"type": "tts", "state": "start"}));
            // Give the speaking transition a beat to land before frames
            std::thread::sleep(std::time::Duration::from_millis(50));
            let count = frames.len() as u64;
            for frame in frames {
                listener.on_incoming_audio(frame);
            }
            // Let playback drain before ending the turn
            std::thread::sleep(std::time::Duration::from_millis(count * 60 + 100));
            listener.on_incoming_json(serde_json::json!({"type": "tts", "state": "stop"}));
        });
        Ok(())
    }

    fn send_abort_speaking(&self, _reason: AbortReason) -> Result<(), ProtocolError> {
        Ok(())
    }
}
