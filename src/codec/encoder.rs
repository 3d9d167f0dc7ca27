//! Packet encoding for outgoing float32 audio frames

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::vban::{VbanHeader, HEADER_SIZE};
use crate::protocol::SampleEncoding;

/// Append interleaved samples as little-endian float32
pub fn encode_f32_payload<B: BufMut>(samples: &[f32], out: &mut B) {
    for &s in samples {
        out.put_f32_le(s);
    }
}

/// Builds packets for one stream, reusing a single buffer
pub struct PacketEncoder {
    stream_name: String,
    buffer: BytesMut,
}

impl PacketEncoder {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            buffer: BytesMut::with_capacity(HEADER_SIZE + 256 * 2 * 4),
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Encode one frame: header followed by the float32 payload.
    ///
    /// `samples.len()` must be a whole number of frames for `channels`.
    pub fn encode(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
        frame_counter: u32,
    ) -> Bytes {
        let samples_per_channel = samples.len() / channels.max(1) as usize;
        let header = VbanHeader::audio(
            sample_rate,
            channels,
            samples_per_channel,
            SampleEncoding::Float32,
            &self.stream_name,
            frame_counter,
        );

        self.buffer.reserve(HEADER_SIZE + samples.len() * 4);
        header.write(&mut self.buffer);
        encode_f32_payload(samples, &mut self.buffer);
        self.buffer.split().freeze()
    }
}

/// Bytes a packet of the given shape occupies on the wire
pub fn packet_size(samples_per_channel: usize, channels: u16) -> usize {
    HEADER_SIZE + samples_per_channel * channels as usize * SampleEncoding::Float32.bytes_per_sample()
}
