//! Streaming sample-rate conversion
//!
//! Bridges the driver's native sample rate and the network-negotiated
//! rate. Each instance holds filter state scoped to one fixed
//! source/target pair; a rate change means building a new instance.

use rubato::{FftFixedIn, Resampler};

use crate::error::CodecError;

/// Mono streaming resampler over fixed-size FFT chunks
///
/// Accepts input slices of any length, buffers internally, and emits
/// converted samples as soon as a full chunk is available. Not
/// passthrough-aware: callers skip construction entirely when the two
/// rates already match.
pub struct StreamResampler {
    inner: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    /// Samples waiting for a full chunk
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler converting `input_rate` to `output_rate`
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, CodecError> {
        let chunk = crate::constants::frame_samples(input_rate);
        let inner = FftFixedIn::<f32>::new(
            input_rate as usize,
            output_rate as usize,
            chunk,
            2,
            1,
        )
        .map_err(|e| CodecError::ResamplerInit(e.to_string()))?;

        Ok(Self {
            inner,
            input_rate,
            output_rate,
            pending: Vec::with_capacity(chunk * 2),
        })
    }

    /// Feed input samples, returning whatever converted output is ready
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, CodecError> {
        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }

            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let mut converted = self
                .inner
                .process(&[chunk], None)
                .map_err(|e| CodecError::ResamplingFailed(e.to_string()))?;

            output.append(&mut converted[0]);
        }

        Ok(output)
    }

    /// Source sample rate
    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Target sample rate
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::frame_samples;

    #[test]
    fn test_downsample_ratio() {
        let mut resampler = StreamResampler::new(48_000, 16_000).unwrap();

        let frame = vec![0.25f32; frame_samples(48_000)];
        let mut total_out = 0usize;
        let mut total_in = 0usize;
        for _ in 0..10 {
            total_in += frame.len();
            total_out += resampler.process(&frame).unwrap().len();
        }

        // 3:1 ratio, allow one chunk of filter latency
        let expected = total_in / 3;
        assert!(total_out <= expected);
        assert!(total_out >= expected - frame_samples(16_000) * 2);
    }

    #[test]
    fn test_upsample_ratio() {
        let mut resampler = StreamResampler::new(24_000, 48_000).unwrap();

        let frame = vec![0.0f32; frame_samples(24_000)];
        let mut total_out = 0usize;
        for _ in 0..10 {
            total_out += resampler.process(&frame).unwrap().len();
        }

        let expected = frame_samples(24_000) * 10 * 2;
        assert!(total_out <= expected);
        assert!(total_out >= expected - frame_samples(48_000) * 2);
    }

    #[test]
    fn test_short_input_is_buffered() {
        let mut resampler = StreamResampler::new(48_000, 16_000).unwrap();

        // Half a frame produces nothing yet
        let half = vec![0.0f32; frame_samples(48_000) / 2];
        assert!(resampler.process(&half).unwrap().is_empty());

        // The second half completes the chunk
        let out = resampler.process(&half).unwrap();
        assert!(!out.is_empty());
    }
}
