//! Buffers between the network and the audio callbacks
//!
//! [`JitterRingBuffer`] is owned by the playback callback and absorbs
//! irregular frame arrival. [`SampleQueue`] and [`FramePool`] are the
//! lock-free single-producer single-consumer hand-offs that carry samples
//! across the boundary between the network tasks and the audio callbacks.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::resample::{i16_to_f32, interpolate};

/// Fixed-capacity circular sample store with pre-buffering.
///
/// Starts in the buffering state and only begins producing audio once
/// `prebuffer` samples are queued. Running dry mid-pull switches back to
/// buffering, so every glitch costs one pre-buffer worth of latency
/// instead of a stream of clicks.
pub struct JitterRingBuffer {
    samples: Box<[f32]>,
    write_pos: usize,
    read_pos: usize,
    /// Fractional read head, relative to `read_pos`
    head_offset: f64,
    available: usize,
    playing: bool,
    prebuffer: usize,
    overflowed: u64,
    underruns: u64,
}

impl JitterRingBuffer {
    /// Create a buffer holding `capacity` samples that starts playing once
    /// `prebuffer` samples are available.
    pub fn new(capacity: usize, prebuffer: usize) -> Self {
        assert!(capacity > 0, "Capacity must be non-zero");

        Self {
            samples: vec![0.0; capacity].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
            head_offset: 0.0,
            available: 0,
            playing: false,
            prebuffer: prebuffer.clamp(1, capacity),
            overflowed: 0,
            underruns: 0,
        }
    }

    /// Append a frame of PCM16 samples
    pub fn push(&mut self, frame: &[i16]) {
        for &sample in frame {
            self.push_sample(sample);
        }
    }

    /// Append one sample, overwriting the oldest one when full
    #[inline]
    pub fn push_sample(&mut self, sample: i16) {
        let capacity = self.samples.len();

        self.samples[self.write_pos] = i16_to_f32(sample);
        self.write_pos = (self.write_pos + 1) % capacity;
        self.available += 1;

        if self.available > capacity {
            self.read_pos = (self.read_pos + 1) % capacity;
            self.available = capacity;
            self.overflowed += 1;
        }
    }

    /// Fill `out` by reading `step` source samples per output sample with
    /// linear interpolation, and return the samples left afterwards.
    ///
    /// While buffering, `out` is silence. Running out of data mid-pull
    /// silences the rest of `out` and returns to buffering. Only whole
    /// source samples are released; the fractional part of the read head
    /// carries into the next pull.
    pub fn drain(&mut self, out: &mut [f32], step: f64) -> usize {
        if !self.playing {
            if self.available >= self.prebuffer {
                self.playing = true;
                self.head_offset = 0.0;
            } else {
                out.fill(0.0);
                return self.available;
            }
        }

        let capacity = self.samples.len();
        let mut offset = self.head_offset;
        let mut filled = 0;

        for slot in out.iter_mut() {
            let whole = offset as usize;
            if whole >= self.available {
                break;
            }

            let index = (self.read_pos + whole) % capacity;
            let current = self.samples[index];
            // Hold the newest sample rather than interpolate into unwritten data
            let next = if whole + 1 < self.available {
                self.samples[(index + 1) % capacity]
            } else {
                current
            };

            *slot = interpolate(current, next, offset.fract() as f32);
            offset += step;
            filled += 1;
        }

        if filled < out.len() {
            out[filled..].fill(0.0);
            self.playing = false;
            self.underruns += 1;
        }

        let consumed = (offset as usize).min(self.available);
        self.read_pos = (self.read_pos + consumed) % capacity;
        self.available -= consumed;
        self.head_offset = if self.playing {
            offset - consumed as f64
        } else {
            0.0
        };

        self.available
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn prebuffer(&self) -> usize {
        self.prebuffer
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Integer read cursor
    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Absolute fractional read head, wrapped to the capacity
    pub fn read_head(&self) -> f64 {
        (self.read_pos as f64 + self.head_offset) % self.samples.len() as f64
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            available: self.available,
            capacity: self.samples.len(),
            playing: self.playing,
            overflowed: self.overflowed,
            underruns: self.underruns,
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterStats {
    pub available: usize,
    pub capacity: usize,
    pub playing: bool,
    /// Samples lost to overwrite-oldest
    pub overflowed: u64,
    /// Pulls cut short by an empty buffer
    pub underruns: u64,
}

/// Lock-free sample hand-off from the network side to the playback callback.
///
/// When full, the oldest queued sample is discarded to make room, matching
/// the jitter buffer's own overflow policy.
pub struct SampleQueue {
    queue: ArrayQueue<i16>,
    overflow_count: AtomicUsize,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Queue every sample of a frame
    pub fn push_frame(&self, samples: impl IntoIterator<Item = i16>) {
        for sample in samples {
            if self.queue.force_push(sample).is_some() {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn pop(&self) -> Option<i16> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a sample queue
pub type SharedSampleQueue = Arc<SampleQueue>;

/// Pre-allocated frame buffers for the capture callback.
///
/// The callback takes a buffer, fills it with at most
/// [`FramePool::frame_samples`] samples and hands it to the network side,
/// which returns it with [`FramePool::recycle`] once sent. An exhausted
/// pool means the network is not keeping up and the block is dropped.
pub struct FramePool {
    free: ArrayQueue<Vec<i16>>,
    frame_samples: usize,
}

impl FramePool {
    /// Create a pool of `frames` buffers with room for `frame_samples` each
    pub fn new(frames: usize, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        let free = ArrayQueue::new(frames.max(1));
        for _ in 0..frames.max(1) {
            let _ = free.push(Vec::with_capacity(frame_samples));
        }
        Self {
            free,
            frame_samples,
        }
    }

    pub fn take(&self) -> Option<Vec<i16>> {
        self.free.pop()
    }

    /// Return a buffer. Buffers too small to hold a full frame are dropped
    /// so that filling a pooled buffer never reallocates.
    pub fn recycle(&self, mut frame: Vec<i16>) {
        if frame.capacity() < self.frame_samples {
            return;
        }
        frame.clear();
        let _ = self.free.push(frame);
    }

    /// Samples each pooled buffer holds without growing
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Thread-safe handle to a frame pool
pub type SharedFramePool = Arc<FramePool>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(len: usize) -> Vec<i16> {
        (0..len).map(|i| (i as i16) * 8).collect()
    }

    #[test]
    fn test_stays_buffering_below_threshold() {
        let mut ring = JitterRingBuffer::new(64, 16);
        ring.push(&ramp(15));

        let mut out = [1.0f32; 8];
        let left = ring.drain(&mut out, 1.0);

        assert!(!ring.is_playing());
        assert_eq!(left, 15);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_starts_playing_at_threshold() {
        let mut ring = JitterRingBuffer::new(64, 16);
        let frame = ramp(16);
        ring.push(&frame);

        let mut out = [0.0f32; 8];
        let left = ring.drain(&mut out, 1.0);

        assert!(ring.is_playing());
        assert_eq!(left, 8);
        assert_eq!(ring.read_pos(), 8);
        for (i, &s) in out.iter().enumerate() {
            assert_eq!(s, i16_to_f32(frame[i]));
        }
    }

    #[test]
    fn test_underrun_fills_silence_and_rebuffers() {
        let mut ring = JitterRingBuffer::new(64, 4);
        ring.push(&[1000, 2000, 3000, 4000, 5000, 6000]);

        let mut out = [9.0f32; 10];
        let left = ring.drain(&mut out, 1.0);

        assert_eq!(left, 0);
        assert!(!ring.is_playing());
        assert_eq!(out[5], i16_to_f32(6000));
        assert!(out[6..].iter().all(|&s| s == 0.0));
        assert_eq!(ring.stats().underruns, 1);

        // Needs a full pre-buffer again before producing sound
        ring.push(&[100, 100, 100]);
        let mut out = [9.0f32; 2];
        ring.drain(&mut out, 1.0);
        assert_eq!(out, [0.0, 0.0]);
    }

    #[test]
    fn test_fractional_head_carries_between_pulls() {
        let mut ring = JitterRingBuffer::new(64, 4);
        ring.push(&ramp(32));

        // 4 outputs at step 1/3 advance the head by 4/3: one whole sample
        let mut out = [0.0f32; 4];
        let left = ring.drain(&mut out, 1.0 / 3.0);
        assert_eq!(left, 31);
        assert_eq!(ring.read_pos(), 1);
        assert!((ring.read_head() - 4.0 / 3.0).abs() < 1e-9);

        // A third of the way from sample 1 to sample 2
        let mut out = [0.0f32; 1];
        ring.drain(&mut out, 1.0);
        let expected = interpolate(i16_to_f32(8), i16_to_f32(16), (1.0f64 / 3.0) as f32);
        assert!((out[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_overwrites_oldest_on_overflow() {
        let mut ring = JitterRingBuffer::new(8, 4);
        ring.push(&ramp(10));

        let stats = ring.stats();
        assert_eq!(stats.available, 8);
        assert_eq!(stats.overflowed, 2);
        assert_eq!(ring.read_pos(), 2);
        assert_eq!(ring.write_pos(), 2);

        let mut out = [0.0f32; 8];
        ring.drain(&mut out, 1.0);
        assert_eq!(out[0], i16_to_f32(16));
        assert_eq!(out[7], i16_to_f32(72));
    }

    #[test]
    fn test_read_cursor_wraps() {
        let mut ring = JitterRingBuffer::new(8, 1);
        let mut out = [0.0f32; 6];

        ring.push(&ramp(6));
        ring.drain(&mut out, 1.0);
        ring.push(&[500, 600, 700, 800, 900, 1000]);
        ring.drain(&mut out, 1.0);

        assert_eq!(out[0], i16_to_f32(500));
        assert_eq!(out[5], i16_to_f32(1000));
        assert!(ring.read_pos() < ring.capacity());
        assert!(ring.write_pos() < ring.capacity());
    }

    #[test]
    fn test_sample_queue_drops_oldest() {
        let queue = SampleQueue::new(4);
        queue.push_frame([1, 2, 3, 4, 5, 6]);

        assert_eq!(queue.overflow_count(), 2);
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_frame_pool_recycles() {
        let pool = FramePool::new(2, 320);
        let mut a = pool.take().unwrap();
        let _b = pool.take().unwrap();
        assert!(pool.take().is_none());

        a.extend_from_slice(&[1, 2, 3]);
        pool.recycle(a);
        let again = pool.take().unwrap();
        assert!(again.is_empty());
        assert!(again.capacity() >= 320);
    }

    #[test]
    fn test_frame_pool_rejects_small_buffers() {
        let pool = FramePool::new(2, 320);
        let _a = pool.take().unwrap();

        pool.recycle(vec![1, 2, 3]);
        assert_eq!(pool.available(), 1);

        pool.recycle(Vec::with_capacity(640));
        assert_eq!(pool.available(), 2);
    }

    proptest! {
        #[test]
        fn prop_overflow_holds_at_capacity(
            capacity in 1usize..512,
            frames in proptest::collection::vec(proptest::collection::vec(any::<i16>(), 0..300), 1..20),
        ) {
            let mut ring = JitterRingBuffer::new(capacity, capacity / 2);
            let mut pushed = 0usize;
            for frame in &frames {
                ring.push(frame);
                pushed += frame.len();
                prop_assert!(ring.available() <= capacity);
                prop_assert!(ring.read_pos() < capacity);
                prop_assert!(ring.write_pos() < capacity);
            }
            prop_assert_eq!(ring.available(), pushed.min(capacity));
        }
    }
}
