//! Shared data model: formats, endpoints and playback requests

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_CHANNELS, DEFAULT_FRAME_SAMPLES, DEFAULT_RX_STREAM_NAME, DEFAULT_SAMPLE_RATE,
    DEFAULT_TX_STREAM_NAME, DEFAULT_UDP_PORT,
};

/// Logical channel ("pad" or input slot) identifier
pub type ChannelId = u32;

/// Sample encoding of a PCM stream
///
/// Discriminants are the VBAN data-type codes (low 3 bits of the
/// `format_bit` header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    Int16 = 0x01,
    Int24 = 0x02,
    Int32 = 0x03,
    Float32 = 0x04,
    Float64 = 0x05,
}

impl SampleEncoding {
    /// Map a wire data-type code to an encoding this engine decodes
    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0x07 {
            0x01 => Some(Self::Int16),
            0x02 => Some(Self::Int24),
            0x03 => Some(Self::Int32),
            0x04 => Some(Self::Float32),
            0x05 => Some(Self::Float64),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int24 => 3,
            Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// Format of an interleaved audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, encoding: SampleEncoding) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
        }
    }

    /// Interleaved float format, as produced by every decode path
    pub fn float(sample_rate: u32, channels: u16) -> Self {
        Self::new(sample_rate, channels, SampleEncoding::Float32)
    }

    /// Interleaved samples per second of audio
    pub fn samples_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels.max(1) as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::float(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS)
    }
}

/// Network side of an endpoint: a VBAN stream on a UDP port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkEndpoint {
    /// Destination for output; optional sender filter for input
    /// (empty or `0.0.0.0` accepts any sender)
    pub remote_ip: String,
    pub port: u16,
    /// ASCII, at most 16 bytes on the wire
    pub stream_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in each packet
    pub frame_samples: usize,
}

impl NetworkEndpoint {
    /// Defaults for an outgoing stream
    pub fn transmit_default() -> Self {
        Self {
            stream_name: DEFAULT_TX_STREAM_NAME.to_string(),
            ..Self::default()
        }
    }

    /// Defaults for an incoming stream
    pub fn receive_default() -> Self {
        Self {
            stream_name: DEFAULT_RX_STREAM_NAME.to_string(),
            ..Self::default()
        }
    }

    /// Sender address filter for receiving, `None` meaning any sender
    pub fn sender_filter(&self) -> Option<IpAddr> {
        let ip = self.remote_ip.trim();
        if ip.is_empty() {
            return None;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) if addr.is_unspecified() => None,
            Ok(addr) => Some(addr),
            Err(_) => {
                tracing::warn!("Ignoring unparsable sender filter '{}'", ip);
                None
            }
        }
    }

    /// Format a receiver expects before any packet has locked one
    pub fn nominal_format(&self) -> AudioFormat {
        AudioFormat::float(self.sample_rate, self.channels)
    }
}

impl Default for NetworkEndpoint {
    fn default() -> Self {
        Self {
            remote_ip: "127.0.0.1".to_string(),
            port: DEFAULT_UDP_PORT,
            stream_name: DEFAULT_TX_STREAM_NAME.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_samples: DEFAULT_FRAME_SAMPLES,
        }
    }
}

/// Where audio goes (output) or comes from (input)
///
/// Holds configuration only, never live resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Endpoint {
    Local {
        /// Device id as listed by `audio::device::list_devices`; empty
        /// selects the system default
        #[serde(default)]
        device_id: String,
        #[serde(default)]
        is_loopback: bool,
    },
    Network(NetworkEndpoint),
}

impl Endpoint {
    /// Local endpoint on the system default device
    pub fn default_device() -> Self {
        Endpoint::Local {
            device_id: String::new(),
            is_loopback: false,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Endpoint::Network(_))
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::default_device()
    }
}

/// One playback of a trimmed, gain-adjusted clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRequest {
    pub source: PathBuf,
    pub start_ms: u64,
    /// 0 plays to the end of the file
    pub end_ms: u64,
    /// Clamped to [-60, +20] before use
    pub gain_db: f32,
    pub destination: Endpoint,
}

impl PlaybackRequest {
    /// Whole file at unity gain on the default device
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            start_ms: 0,
            end_ms: 0,
            gain_db: 0.0,
            destination: Endpoint::default(),
        }
    }

    pub fn with_window(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.start_ms = start_ms;
        self.end_ms = end_ms;
        self
    }

    pub fn with_gain_db(mut self, gain_db: f32) -> Self {
        self.gain_db = gain_db;
        self
    }

    pub fn with_destination(mut self, destination: Endpoint) -> Self {
        self.destination = destination;
        self
    }
}

/// Audio device information for selection lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_loopback: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}
