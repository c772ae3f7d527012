//! Audio capture from the input device
//!
//! Each device block is reduced to mono, resampled to the transport rate
//! and quantized to PCM16. Blocks are always resampled so the resampler's
//! phase stays continuous, but only handed to the network while the
//! transmit gate is open. Nothing is queued while idle.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::audio::buffer::SharedFramePool;
use crate::audio::resample::Downsampler;
use crate::constants::TRANSPORT_SAMPLE_RATE;
use crate::network::Outgoing;

/// Per-block capture processing, independent of any device
pub struct CapturePipeline {
    downsampler: Downsampler,
    channels: usize,
    mono: Vec<f32>,
    resampled: Vec<i16>,
}

impl CapturePipeline {
    /// Pipeline for a device delivering `channels` interleaved channels at
    /// `device_rate`. Only the first channel is captured.
    pub fn new(device_rate: u32, channels: u16) -> Self {
        Self {
            downsampler: Downsampler::new(device_rate, TRANSPORT_SAMPLE_RATE),
            channels: channels.max(1) as usize,
            mono: Vec::with_capacity(4096),
            resampled: Vec::with_capacity(4096),
        }
    }

    /// Process one interleaved device block.
    ///
    /// Returns the transport-rate frame when `transmitting`, `None`
    /// otherwise (or when the block was too short to yield a sample).
    pub fn process(&mut self, interleaved: &[f32], transmitting: bool) -> Option<&[i16]> {
        if self.channels == 1 {
            self.downsampler.process(interleaved, &mut self.resampled);
        } else {
            self.mono.clear();
            self.mono
                .extend(interleaved.iter().step_by(self.channels).copied());
            self.downsampler.process(&self.mono, &mut self.resampled);
        }

        if transmitting && !self.resampled.is_empty() {
            Some(&self.resampled)
        } else {
            None
        }
    }

    /// Resampler phase carried into the next block
    pub fn carry(&self) -> f64 {
        self.downsampler.carry()
    }
}

/// Capture counters, readable from outside the audio callback
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl CaptureStats {
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Hands captured frames to the network without blocking or allocating
#[derive(Clone)]
pub struct FrameEmitter {
    pool: SharedFramePool,
    outgoing: mpsc::Sender<Outgoing>,
    stats: Arc<CaptureStats>,
}

impl FrameEmitter {
    pub fn new(pool: SharedFramePool, outgoing: mpsc::Sender<Outgoing>) -> Self {
        Self {
            pool,
            outgoing,
            stats: Arc::new(CaptureStats::default()),
        }
    }

    /// Queue a copy of `frame` for sending, split into pool-sized frames.
    /// Returns false when any part was dropped because the pool or the
    /// outbound queue was exhausted.
    pub fn emit(&self, frame: &[i16]) -> bool {
        let mut all_sent = true;
        for chunk in frame.chunks(self.pool.frame_samples()) {
            all_sent &= self.emit_chunk(chunk);
        }
        all_sent
    }

    fn emit_chunk(&self, frame: &[i16]) -> bool {
        let Some(mut buffer) = self.pool.take() else {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        buffer.extend_from_slice(frame);

        match self.outgoing.try_send(Outgoing::Frame(buffer)) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(msg)) | Err(TrySendError::Closed(msg)) => {
                if let Outgoing::Frame(buffer) = msg {
                    self.pool.recycle(buffer);
                }
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}

/// Push-to-talk gate between the control side and the capture callback.
///
/// The callback holds a [`TransmitPass`] from [`TransmitGate::enter`] while
/// it produces and queues a block. [`TransmitGate::close`] waits for passes
/// still outstanding, so once it returns no block captured while the gate
/// was open can still be queued.
#[derive(Debug, Default)]
pub struct TransmitGate {
    open: AtomicBool,
    in_flight: AtomicUsize,
}

impl TransmitGate {
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Start a block. `None` when the gate is closed.
    pub fn enter(&self) -> Option<TransmitPass<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let pass = TransmitPass { gate: self };
        if self.open.load(Ordering::SeqCst) {
            Some(pass)
        } else {
            None
        }
    }

    /// Close the gate and wait until no block that saw it open is in progress
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Proof that a block started while the gate was open; released on drop
#[derive(Debug)]
pub struct TransmitPass<'a> {
    gate: &'a TransmitGate,
}

impl Drop for TransmitPass<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Thread-safe handle to a transmit gate
pub type SharedTransmitGate = Arc<TransmitGate>;

#[cfg(feature = "talker")]
pub use device_capture::AudioCapture;

#[cfg(feature = "talker")]
mod device_capture {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{FromSample, Sample, SizedSample, StreamConfig};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::{CapturePipeline, FrameEmitter, SharedTransmitGate};
    use crate::audio::device::{get_default_input_device, get_device_by_id, AudioDevice};
    use crate::error::AudioError;

    /// Microphone capture bound to one input device
    pub struct AudioCapture {
        device_id: Option<String>,
        running: Arc<AtomicBool>,
        gate: SharedTransmitGate,
        emitter: FrameEmitter,
        thread_handle: Option<JoinHandle<()>>,
        error_rx: Option<Receiver<AudioError>>,
        device_rate: u32,
        channels: u16,
    }

    impl AudioCapture {
        /// Create a capture for `device_id`, or the host default input
        pub fn new(
            device_id: Option<&str>,
            emitter: FrameEmitter,
            gate: SharedTransmitGate,
        ) -> Result<Self, AudioError> {
            let device = open(device_id)?;
            let default_config = device.default_input_config()?;

            Ok(Self {
                device_id: device_id.map(str::to_string),
                running: Arc::new(AtomicBool::new(false)),
                gate,
                emitter,
                thread_handle: None,
                error_rx: None,
                device_rate: default_config.sample_rate().0,
                channels: default_config.channels(),
            })
        }

        /// Start capturing. Returns once the device stream is playing, or
        /// with the error that kept it from starting.
        pub fn start(&mut self) -> Result<(), AudioError> {
            if self.running.load(Ordering::SeqCst) {
                return Ok(());
            }

            let device = open(self.device_id.as_deref())?;
            let supported = device.default_input_config()?;
            let sample_format = supported.sample_format();
            let config: StreamConfig = supported.config();

            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
            self.error_rx = Some(error_rx);

            let running = self.running.clone();
            let gate = self.gate.clone();
            let emitter = self.emitter.clone();
            let pipeline = CapturePipeline::new(config.sample_rate.0, config.channels);

            running.store(true, Ordering::SeqCst);

            let handle = thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || {
                    let cpal_device = device.into_inner();
                    let stream = match sample_format {
                        cpal::SampleFormat::F32 => build::<f32>(
                            &cpal_device, &config, pipeline, emitter, gate, error_tx,
                        ),
                        cpal::SampleFormat::I16 => build::<i16>(
                            &cpal_device, &config, pipeline, emitter, gate, error_tx,
                        ),
                        cpal::SampleFormat::U16 => build::<u16>(
                            &cpal_device, &config, pipeline, emitter, gate, error_tx,
                        ),
                        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                    };

                    let stream = match stream.and_then(|s| {
                        s.play()
                            .map(|()| s)
                            .map_err(|e| AudioError::StreamError(e.to_string()))
                    }) {
                        Ok(stream) => stream,
                        Err(e) => {
                            running.store(false, Ordering::SeqCst);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));

                    // Keep thread alive while running
                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }

                    drop(stream);
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            self.thread_handle = Some(handle);

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    tracing::info!(
                        "Capture started: {} Hz, {} channel(s)",
                        self.device_rate,
                        self.channels
                    );
                    Ok(())
                }
                Ok(Err(e)) => {
                    self.stop();
                    Err(e)
                }
                Err(_) => {
                    self.stop();
                    Err(AudioError::StreamError("capture thread exited".to_string()))
                }
            }
        }

        /// Stop capturing audio
        pub fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);

            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        pub fn device_rate(&self) -> u32 {
            self.device_rate
        }

        pub fn channels(&self) -> u16 {
            self.channels
        }

        /// Check for stream errors reported by the device
        pub fn check_errors(&self) -> Option<AudioError> {
            self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
        }
    }

    impl Drop for AudioCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn open(device_id: Option<&str>) -> Result<AudioDevice, AudioError> {
        match device_id {
            Some(id) => get_device_by_id(id),
            None => get_default_input_device(),
        }
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut pipeline: CapturePipeline,
        emitter: FrameEmitter,
        gate: SharedTransmitGate,
        error_tx: Sender<AudioError>,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let mut converted: Vec<f32> = Vec::with_capacity(8192);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    converted.clear();
                    converted.extend(data.iter().map(|&s| f32::from_sample(s)));

                    let pass = gate.enter();
                    if let Some(frame) = pipeline.process(&converted, pass.is_some()) {
                        emitter.emit(frame);
                    }
                    drop(pass);
                },
                move |err| {
                    let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::FramePool;

    #[test]
    fn test_idle_blocks_are_resampled_but_not_emitted() {
        let mut pipeline = CapturePipeline::new(44_100, 1);
        let block = [0.25f32; 128];

        assert!(pipeline.process(&block, false).is_none());
        let carry_after_idle = pipeline.carry();
        assert!(carry_after_idle > 0.0);

        let frame = pipeline.process(&block, true).unwrap();
        assert!(!frame.is_empty());
        assert!(frame.iter().all(|&s| s == 8191));
    }

    #[test]
    fn test_stereo_uses_first_channel() {
        let mut pipeline = CapturePipeline::new(48_000, 2);
        // left = 0.5, right = -0.5
        let block: Vec<f32> = (0..96).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();

        let frame = pipeline.process(&block, true).unwrap();
        assert_eq!(frame.len(), 16);
        assert!(frame.iter().all(|&s| s == 16383));
    }

    #[test]
    fn test_block_size_48k_to_16k() {
        let mut pipeline = CapturePipeline::new(48_000, 1);
        let frame = pipeline.process(&[0.0; 960], true).unwrap();
        assert_eq!(frame.len(), 320);
    }

    #[tokio::test]
    async fn test_emitter_drops_when_pool_empty() {
        let pool = Arc::new(FramePool::new(1, 320));
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = FrameEmitter::new(pool.clone(), tx);

        assert!(emitter.emit(&[1, 2, 3]));
        assert!(!emitter.emit(&[4, 5, 6]));
        assert_eq!(emitter.stats().frames_sent(), 1);
        assert_eq!(emitter.stats().frames_dropped(), 1);

        match rx.recv().await {
            Some(Outgoing::Frame(frame)) => {
                assert_eq!(frame, vec![1, 2, 3]);
                pool.recycle(frame);
            }
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(emitter.emit(&[7]));
    }

    #[tokio::test]
    async fn test_emitter_returns_buffer_when_queue_full() {
        let pool = Arc::new(FramePool::new(4, 320));
        let (tx, _rx) = mpsc::channel(1);
        let emitter = FrameEmitter::new(pool.clone(), tx);

        assert!(emitter.emit(&[1]));
        assert!(!emitter.emit(&[2]));
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_emitter_splits_blocks_larger_than_pool_buffers() {
        let pool = Arc::new(FramePool::new(4, 4));
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = FrameEmitter::new(pool, tx);

        let block: Vec<i16> = (0..10).collect();
        assert!(emitter.emit(&block));
        assert_eq!(emitter.stats().frames_sent(), 3);

        let mut received = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(Outgoing::Frame(frame)) => {
                    assert!(frame.len() <= 4);
                    received.extend(frame);
                }
                other => panic!("expected frame, got {:?}", other),
            }
        }
        assert_eq!(received, block);
    }

    #[tokio::test]
    async fn test_gate_close_waits_for_block_in_progress() {
        let gate = TransmitGate::default();
        gate.open();
        let pass = gate.enter();
        assert!(pass.is_some());

        let close = gate.close();
        tokio::pin!(close);
        assert!(tokio::time::timeout(Duration::from_millis(20), &mut close)
            .await
            .is_err());
        assert!(!gate.is_open());
        assert!(gate.enter().is_none());

        drop(pass);
        tokio::time::timeout(Duration::from_secs(1), close)
            .await
            .expect("close returns once the block finishes");
    }

    #[tokio::test]
    async fn test_gate_closed_blocks_are_not_transmitted() {
        let gate = TransmitGate::default();
        let mut pipeline = CapturePipeline::new(48_000, 1);

        let pass = gate.enter();
        assert!(pipeline.process(&[0.5; 960], pass.is_some()).is_none());
        drop(pass);

        tokio::time::timeout(Duration::from_millis(100), gate.close())
            .await
            .expect("nothing in flight");
    }
}
