//! Audio frame types and the driver-side frame ring
//!
//! A frame is one fixed-duration (60 ms) chunk of mono PCM. The ring is
//! a lock-free SPSC queue between the driver callback context and the
//! main loop.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One fixed-duration chunk of mono PCM
#[derive(Clone)]
pub struct AudioFrame {
    /// Mono f32 samples
    pub samples: Vec<f32>,
    /// Sample rate the samples were captured or produced at
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Frame duration in milliseconds
    pub fn duration_ms(&self) -> u32 {
        (self.samples.len() as u64 * 1000 / self.sample_rate as u64) as u32
    }
}

/// Chunks an arbitrary sample stream into fixed-size frames
///
/// Driver callbacks deliver whatever buffer size the hardware uses;
/// the assembler re-blocks that stream into exact frame-size chunks.
pub struct FrameAssembler {
    frame_size: usize,
    buf: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            buf: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Feed samples, returning every completed frame
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.buf.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buf.len() >= self.frame_size {
            frames.push(self.buf.drain(..self.frame_size).collect());
        }
        frames
    }

    /// Drop buffered samples (turn boundary)
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Samples waiting for a full frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Lock-free ring buffer for audio frames
pub struct FrameRing {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
}

impl FrameRing {
    /// Create a new ring with the specified capacity in frames
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a frame; returns false and counts an overflow when full
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest frame, if any
    pub fn pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a frame ring
pub type SharedFrameRing = Arc<FrameRing>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_reblocks_stream() {
        let mut assembler = FrameAssembler::new(100);

        assert!(assembler.push(&vec![0.0; 60]).is_empty());
        let frames = assembler.push(&vec![0.0; 150]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 100);
        assert_eq!(assembler.pending(), 10);

        assembler.clear();
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_ring_fifo_and_overflow() {
        let ring = FrameRing::new(2);

        assert!(ring.push(AudioFrame::new(vec![0.1; 4], 16_000)));
        assert!(ring.push(AudioFrame::new(vec![0.2; 4], 16_000)));
        assert!(!ring.push(AudioFrame::new(vec![0.3; 4], 16_000)));
        assert_eq!(ring.overflow_count(), 1);

        assert_eq!(ring.pop().unwrap().samples[0], 0.1);
        assert_eq!(ring.pop().unwrap().samples[0], 0.2);
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 2880], 48_000);
        assert_eq!(frame.duration_ms(), 60);
    }
}
