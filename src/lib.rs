//! # PTT Radio
//!
//! Push-to-talk voice over WebSocket channels.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────┐                ┌──────────────────────────────────┐
//! │            TALKER                │                │            LISTENER              │
//! │  ┌────────────┐                  │                │                  ┌────────────┐  │
//! │  │ Microphone │ device rate f32  │                │  device rate f32 │  Speaker   │  │
//! │  └─────┬──────┘                  │                │                  └─────▲──────┘  │
//! │        ▼                         │                │                        │         │
//! │  ┌────────────────────────┐      │                │      ┌─────────────────┴──────┐  │
//! │  │ Capture pipeline       │      │                │      │ Playback pipeline      │  │
//! │  │ (audio::capture)       │      │                │      │ (audio::playback)      │  │
//! │  │ downsample to 16 kHz   │      │                │      │ jitter ring + linear   │  │
//! │  │ gate on PTT switch     │      │                │      │ interpolation          │  │
//! │  └─────┬──────────────────┘      │                │      └─────────────────▲──────┘  │
//! │        ▼                         │                │                        │         │
//! │  ┌────────────────────────┐      │                │      ┌─────────────────┴──────┐  │
//! │  │ Client session         │      │                │      │ Client session         │  │
//! │  │ (network::client)      │      │                │      │ (network::client)      │  │
//! │  │ ordered control + PCM  │      │                │      │ frames -> sample queue │  │
//! │  └─────┬──────────────────┘      │                │      └─────────────────▲──────┘  │
//! └────────┼─────────────────────────┘                └────────────────────────┼─────────┘
//!          │ WebSocket: JSON text + s16le binary                               │
//!          ▼                                                                   │
//! ┌─────────────────────────────────────────────────────────────────────────────┴─────────┐
//! │                         RELAY (server + relay::registry)                              │
//! │   connection -> (channel 1..=255, role)                                               │
//! │   join: acknowledge sender only                                                       │
//! │   ptt/busy/binary: forward to every other connection on the sender's channel          │
//! └───────────────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod relay;
pub mod server;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate of audio on the wire
    pub const TRANSPORT_SAMPLE_RATE: u32 = 16_000;

    /// Nominal samples per transmitted frame (20 ms at the transport rate)
    pub const TRANSPORT_FRAME_SAMPLES: usize = 320;

    /// Default relay port
    pub const DEFAULT_PORT: u16 = 8080;

    /// Default playback pre-buffer in milliseconds
    pub const DEFAULT_PREBUFFER_MS: u32 = 100;

    /// Default jitter buffer length in seconds
    pub const DEFAULT_BUFFER_SECONDS: u32 = 2;

    /// Messages queued per connection before new ones are dropped
    pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

    /// Preallocated capture frame buffers
    pub const FRAME_POOL_SIZE: usize = 32;
}
