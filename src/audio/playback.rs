//! Audio playback to the output device
//!
//! Frames received from the network land in a [`SampleQueue`]. The output
//! callback moves them into the jitter buffer it owns and drains that at
//! the device rate, interpolating up from the transport rate.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::audio::buffer::{JitterRingBuffer, JitterStats, SampleQueue};
use crate::audio::resample::step;
use crate::constants::TRANSPORT_SAMPLE_RATE;

/// Playback processing for one output device, independent of the device
pub struct PlaybackPipeline {
    ring: JitterRingBuffer,
    step: f64,
}

impl PlaybackPipeline {
    /// Pipeline rendering at `device_rate` from a jitter buffer of
    /// `capacity` samples that waits for `prebuffer` samples before playing
    pub fn new(device_rate: u32, capacity: usize, prebuffer: usize) -> Self {
        Self {
            ring: JitterRingBuffer::new(capacity, prebuffer),
            step: step(TRANSPORT_SAMPLE_RATE, device_rate),
        }
    }

    /// Push a received frame, whatever the playing state
    pub fn receive(&mut self, frame: &[i16]) {
        self.ring.push(frame);
    }

    /// Move everything waiting in `queue` into the jitter buffer
    pub fn feed_from(&mut self, queue: &SampleQueue) -> usize {
        let mut moved = 0;
        while let Some(sample) = queue.pop() {
            self.ring.push_sample(sample);
            moved += 1;
        }
        moved
    }

    /// Render one device pull of mono samples
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        self.ring.drain(out, self.step)
    }

    pub fn is_playing(&self) -> bool {
        self.ring.is_playing()
    }

    pub fn stats(&self) -> JitterStats {
        self.ring.stats()
    }
}

/// Snapshot of playback state published by the output callback
#[derive(Debug, Default)]
pub struct PlaybackStats {
    available: AtomicUsize,
    playing: AtomicBool,
    underruns: AtomicU64,
    overflowed: AtomicU64,
}

impl PlaybackStats {
    pub fn publish(&self, stats: &JitterStats) {
        self.available.store(stats.available, Ordering::Relaxed);
        self.playing.store(stats.playing, Ordering::Relaxed);
        self.underruns.store(stats.underruns, Ordering::Relaxed);
        self.overflowed.store(stats.overflowed, Ordering::Relaxed);
    }

    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }
}

#[cfg(feature = "talker")]
pub use device_playback::AudioPlayback;

#[cfg(feature = "talker")]
mod device_playback {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{FromSample, Sample, SizedSample, StreamConfig};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::{PlaybackPipeline, PlaybackStats};
    use crate::audio::buffer::SharedSampleQueue;
    use crate::audio::device::{get_default_output_device, get_device_by_id, AudioDevice};
    use crate::error::AudioError;

    /// Speaker output bound to one output device
    pub struct AudioPlayback {
        device_id: Option<String>,
        inbound: SharedSampleQueue,
        capacity: usize,
        prebuffer: usize,
        running: Arc<AtomicBool>,
        stats: Arc<PlaybackStats>,
        thread_handle: Option<JoinHandle<()>>,
        error_rx: Option<Receiver<AudioError>>,
    }

    impl AudioPlayback {
        /// Create a playback for `device_id`, or the host default output,
        /// fed from `inbound`
        pub fn new(
            device_id: Option<&str>,
            inbound: SharedSampleQueue,
            capacity: usize,
            prebuffer: usize,
        ) -> Self {
            Self {
                device_id: device_id.map(str::to_string),
                inbound,
                capacity,
                prebuffer,
                running: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(PlaybackStats::default()),
                thread_handle: None,
                error_rx: None,
            }
        }

        /// Start playback. Returns once the device stream is playing, or
        /// with the error that kept it from starting.
        pub fn start(&mut self) -> Result<(), AudioError> {
            if self.running.load(Ordering::SeqCst) {
                return Ok(());
            }

            let device = open(self.device_id.as_deref())?;
            let supported = device.default_output_config()?;
            let sample_format = supported.sample_format();
            let config: StreamConfig = supported.config();

            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
            self.error_rx = Some(error_rx);

            let output = Output {
                pipeline: PlaybackPipeline::new(config.sample_rate.0, self.capacity, self.prebuffer),
                inbound: self.inbound.clone(),
                stats: self.stats.clone(),
                channels: config.channels.max(1) as usize,
                mono: Vec::with_capacity(8192),
            };
            let running = self.running.clone();
            running.store(true, Ordering::SeqCst);

            tracing::info!(
                "Starting playback: {} Hz, {} channel(s), {} sample pre-buffer",
                config.sample_rate.0,
                config.channels,
                self.prebuffer
            );

            let handle = thread::Builder::new()
                .name("playback".to_string())
                .spawn(move || {
                    let cpal_device = device.into_inner();
                    let stream = match sample_format {
                        cpal::SampleFormat::F32 => build::<f32>(&cpal_device, &config, output, error_tx),
                        cpal::SampleFormat::I16 => build::<i16>(&cpal_device, &config, output, error_tx),
                        cpal::SampleFormat::U16 => build::<u16>(&cpal_device, &config, output, error_tx),
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

                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }

                    drop(stream);
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            self.thread_handle = Some(handle);

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    self.stop();
                    Err(e)
                }
                Err(_) => {
                    self.stop();
                    Err(AudioError::StreamError("playback thread exited".to_string()))
                }
            }
        }

        /// Stop playback
        pub fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);

            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        pub fn stats(&self) -> Arc<PlaybackStats> {
            self.stats.clone()
        }

        /// Check for stream errors reported by the device
        pub fn check_errors(&self) -> Option<AudioError> {
            self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
        }
    }

    impl Drop for AudioPlayback {
        fn drop(&mut self) {
            self.stop();
        }
    }

    /// State owned by the output callback
    struct Output {
        pipeline: PlaybackPipeline,
        inbound: SharedSampleQueue,
        stats: Arc<PlaybackStats>,
        channels: usize,
        mono: Vec<f32>,
    }

    impl Output {
        fn fill<T>(&mut self, data: &mut [T])
        where
            T: SizedSample + FromSample<f32>,
        {
            let frames = data.len() / self.channels;
            self.mono.resize(frames, 0.0);

            self.pipeline.feed_from(&self.inbound);
            self.pipeline.render(&mut self.mono);
            self.stats.publish(&self.pipeline.stats());

            for (frame, &sample) in data.chunks_mut(self.channels).zip(self.mono.iter()) {
                let value = T::from_sample(sample);
                for slot in frame.iter_mut() {
                    *slot = value;
                }
            }
        }
    }

    fn open(device_id: Option<&str>) -> Result<AudioDevice, AudioError> {
        match device_id {
            Some(id) => get_device_by_id(id),
            None => get_default_output_device(),
        }
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut output: Output,
        error_tx: Sender<AudioError>,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: SizedSample + FromSample<f32>,
    {
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| output.fill(data),
                move |err| {
                    let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }
}
