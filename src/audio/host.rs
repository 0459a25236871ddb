//! cpal-backed audio driver for host builds
//!
//! Runs capture and playback through the default host devices. The
//! streams live on a dedicated thread because cpal streams are not
//! `Send`; callbacks only move samples through lock-free rings and post
//! readiness events.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::app::events::EventBus;
use crate::audio::driver::AudioDriver;
use crate::audio::frame::{AudioFrame, FrameAssembler, FrameRing, SharedFrameRing};
use crate::constants::{frame_samples, RING_BUFFER_CAPACITY};
use crate::error::AudioError;

/// Seconds of playback the output ring can hold
const OUTPUT_RING_SECS: usize = 2;

/// Default-device audio driver backed by cpal
pub struct CpalDriver {
    sample_rate: u32,
    input_ring: SharedFrameRing,
    output_ring: Arc<ArrayQueue<f32>>,
    output_dropped: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDriver {
    /// Create a driver running both directions at `sample_rate`
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            input_ring: Arc::new(FrameRing::new(RING_BUFFER_CAPACITY)),
            output_ring: Arc::new(ArrayQueue::new(sample_rate as usize * OUTPUT_RING_SECS)),
            output_dropped: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn build_streams(
        sample_rate: u32,
        input_ring: SharedFrameRing,
        output_ring: Arc<ArrayQueue<f32>>,
        events: EventBus,
    ) -> Result<(cpal::Stream, cpal::Stream), AudioError> {
        let host = cpal::default_host();

        let input_device = host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no input device".to_string()))?;
        let output_device = host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("no output device".to_string()))?;

        let input_channels = input_device
            .default_input_config()
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?
            .channels() as usize;
        let output_channels = output_device
            .default_output_config()
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?
            .channels() as usize;

        let input_config = StreamConfig {
            channels: input_channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let output_config = StreamConfig {
            channels: output_channels as u16,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Capture: downmix to mono, re-block into 60 ms frames
        let input_events = events.clone();
        let mut assembler = FrameAssembler::new(frame_samples(sample_rate));
        let input_stream = input_device
            .build_input_stream(
                &input_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono: Vec<f32> = data
                        .chunks(input_channels)
                        .map(|c| c.iter().sum::<f32>() / input_channels as f32)
                        .collect();

                    for samples in assembler.push(&mono) {
                        input_ring.push(AudioFrame::new(samples, sample_rate));
                        input_events.notify_audio_input_ready();
                    }
                },
                |err| tracing::error!("input stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        // Playback: mono ring fanned out to every hardware channel,
        // silence on underrun
        let output_stream = output_device
            .build_output_stream(
                &output_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut consumed = false;
                    for frame in data.chunks_mut(output_channels) {
                        let sample = match output_ring.pop() {
                            Some(s) => {
                                consumed = true;
                                s
                            }
                            None => 0.0,
                        };
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                    }
                    if consumed {
                        events.notify_audio_output_ready();
                    }
                },
                |err| tracing::error!("output stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        input_stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        output_stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok((input_stream, output_stream))
    }
}

impl crate::audio::driver::AudioDriver for CpalDriver {
    fn start(&mut self, events: EventBus) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let sample_rate = self.sample_rate;
        let input_ring = self.input_ring.clone();
        let output_ring = self.output_ring.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("audio-driver".to_string())
            .spawn(move || {
                let streams =
                    Self::build_streams(sample_rate, input_ring, output_ring, events);
                match streams {
                    Ok((_input, _output)) => {
                        let _ = ready_tx.send(Ok(()));
                        // Streams stay alive while this thread parks
                        while running.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(50));
                        }
                    }
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        self.thread = Some(handle);

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(result) => result,
            Err(_) => Err(AudioError::StreamError(
                "audio driver start timed out".to_string(),
            )),
        }
    }

    fn read(&mut self) -> Option<AudioFrame> {
        self.input_ring.pop()
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        let mut dropped = 0usize;
        for &sample in samples {
            if self.output_ring.push(sample).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.output_dropped.fetch_add(dropped, Ordering::Relaxed);
            return Err(AudioError::BufferOverflow);
        }
        Ok(())
    }

    fn flush_output(&mut self) {
        while self.output_ring.pop().is_some() {}
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
