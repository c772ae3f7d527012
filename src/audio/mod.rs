//! Audio subsystem: resampling, jitter buffering and the device pipelines

pub mod buffer;
pub mod capture;
#[cfg(feature = "talker")]
pub mod device;
pub mod playback;
pub mod resample;

pub use buffer::{FramePool, JitterRingBuffer, SampleQueue};
pub use capture::{CapturePipeline, FrameEmitter, TransmitGate};
pub use playback::PlaybackPipeline;
pub use resample::Downsampler;

#[cfg(feature = "talker")]
pub use capture::AudioCapture;
#[cfg(feature = "talker")]
pub use device::{list_devices, AudioDeviceInfo};
#[cfg(feature = "talker")]
pub use playback::AudioPlayback;
