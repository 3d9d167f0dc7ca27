//! # Pad Audio Engine
//!
//! Real-time audio I/O and network streaming core for a pad-trigger sampler.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          PadEngine (engine)                               │
//! │                                                                           │
//! │  ┌──────────────────────────────┐      ┌──────────────────────────────┐   │
//! │  │  PlaybackEngine              │      │  Capture taps (per input)    │   │
//! │  │  ChannelTable: id -> set     │      │                              │   │
//! │  │                              │      │  ┌────────┐    ┌──────────┐  │   │
//! │  │  ┌────────┐    ┌──────────┐  │      │  │ cpal   │ or │  VBAN    │  │   │
//! │  │  │ Clip   │──▶ │ Local    │  │      │  │ input/ │    │ Receiver │  │   │
//! │  │  │ Reader │    │ Output   │  │      │  │loopback│    │ (thread) │  │   │
//! │  │  │ (trim, │    └──────────┘  │      │  └───┬────┘    └────┬─────┘  │   │
//! │  │  │  gain) │    ┌──────────┐  │      │      ▼              ▼        │   │
//! │  │  │        │──▶ │ Pacing   │  │      │  ┌──────────────────────────┐│   │
//! │  │  └────────┘    │ thread + │  │      │  │ RollingBuffer (metering, ││   │
//! │  │                │ VBAN Tx  │  │      │  │ read-all, commit to WAV) ││   │
//! │  │                └────┬─────┘  │      │  └──────────────────────────┘│   │
//! │  └─────────────────────┼────────┘      └──────────────────────────────┘   │
//! └────────────────────────┼──────────────────────────────▲───────────────────┘
//!                          │ UDP: [VBAN header 28B | PCM]  │
//!                          ▼                               │
//!                    remote receiver               remote transmitter
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod network;
pub mod protocol;

pub use engine::{PadEngine, PlaybackEngine, PlaybackEvent};
pub use error::{Error, Result};
pub use protocol::{AudioFormat, ChannelId, Endpoint, NetworkEndpoint, PlaybackRequest, SampleEncoding};

/// Engine-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default UDP port for VBAN streams
    pub const DEFAULT_UDP_PORT: u16 = 6980;

    /// Default samples per channel in each transmitted packet
    pub const DEFAULT_FRAME_SAMPLES: usize = 256;

    /// Default name of the stream this engine transmits
    pub const DEFAULT_TX_STREAM_NAME: &str = "ECHO_OUT";

    /// Default name of the stream this engine listens for
    pub const DEFAULT_RX_STREAM_NAME: &str = "ECHO_IN";

    /// Default rolling capture length in seconds
    pub const DEFAULT_ROLLING_SECONDS: u32 = 30;

    /// Default metering window in milliseconds
    pub const DEFAULT_METER_WINDOW_MS: u32 = 120;

    /// Silence floor reported by dB meters
    pub const SILENCE_DB: f32 = -90.0;

    /// Gain range accepted by playback, in dB
    pub const MIN_GAIN_DB: f32 = -60.0;
    pub const MAX_GAIN_DB: f32 = 20.0;

    /// Largest payload that fits one Ethernet frame (MTU - IP/UDP headers)
    pub const MAX_PACKET_SIZE: usize = 1472;
}
