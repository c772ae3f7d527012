//! Sample-rate conversion between device rates and the transport rate
//!
//! Capture uses [`Downsampler`], a nearest-sample decimator that carries its
//! fractional position across blocks. Playback interpolates linearly while
//! draining the jitter buffer (see [`interpolate`] and
//! [`crate::audio::buffer::JitterRingBuffer::drain`]).
//!
//! Neither direction filters; aliasing is accepted in exchange for latency.

/// Convert a normalized sample to PCM16.
///
/// Clamps to `[-1, 1]`, then scales negative values by 32768 and
/// non-negative values by 32767, truncating toward zero.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Convert a PCM16 sample to a normalized float
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Linear interpolation between two neighbouring samples
#[inline]
pub fn interpolate(a: f32, b: f32, frac: f32) -> f32 {
    a + frac * (b - a)
}

/// Source samples consumed per destination sample
#[inline]
pub fn step(source_rate: u32, destination_rate: u32) -> f64 {
    source_rate as f64 / destination_rate as f64
}

/// Decimating resampler for the capture direction.
///
/// Advances through the input by `input_rate / output_rate` per output
/// sample and picks the sample at the integer part of the position. The
/// position left over past the end of a block carries into the next call,
/// keeping phase continuous across device callbacks.
#[derive(Debug, Clone)]
pub struct Downsampler {
    ratio: f64,
    position: f64,
}

impl Downsampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            ratio: step(input_rate, output_rate),
            position: 0.0,
        }
    }

    /// Fractional position carried into the next block
    pub fn carry(&self) -> f64 {
        self.position
    }

    /// Resample one block into `out` as PCM16, replacing its contents.
    ///
    /// Does not allocate once `out` has grown to the largest block seen.
    /// An empty block produces no output and leaves the carry untouched.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<i16>) -> usize {
        out.clear();
        if input.is_empty() {
            return 0;
        }

        let len = input.len() as f64;
        let mut position = self.position;
        while position < len {
            out.push(f32_to_i16(input[position as usize]));
            position += self.ratio;
        }
        self.position = position - len;

        out.len()
    }
}

/// One-shot form of the capture resampler: `(output, new_carry)` for a block
/// starting at `carry`.
pub fn downsample(input: &[f32], input_rate: u32, output_rate: u32, carry: f64) -> (Vec<i16>, f64) {
    let mut resampler = Downsampler {
        ratio: step(input_rate, output_rate),
        position: carry,
    };
    let mut out = Vec::with_capacity((input.len() as f64 / resampler.ratio).ceil() as usize + 1);
    resampler.process(input, &mut out);
    (out, resampler.carry())
}
