//! VBAN audio header framing
//!
//! ```text
//!  0      4        5        6        7        8                 24       28
//!  ┌──────┬────────┬────────┬────────┬────────┬─────────────────┬────────┐
//!  │"VBAN"│sp|srIdx│ nbs-1  │ nbc-1  │codec|dt│ stream name[16] │ frame  │
//!  │      │3b | 5b │        │        │ 4b | 3b│ ASCII, NUL pad  │ u32 LE │
//!  └──────┴────────┴────────┴────────┴────────┴─────────────────┴────────┘
//! ```

use bytes::BufMut;

use crate::error::CodecError;
use crate::protocol::{AudioFormat, SampleEncoding};

/// Size of the fixed header preceding every payload
pub const HEADER_SIZE: usize = 28;

pub const MAGIC: [u8; 4] = *b"VBAN";

/// Bytes reserved for the stream name
pub const STREAM_NAME_LEN: usize = 16;

/// Sub-protocol value (top 3 bits of byte 4) for audio frames
pub const SUB_PROTOCOL_AUDIO: u8 = 0x00;

/// Codec value (top nibble of byte 7) for uncompressed PCM
pub const CODEC_PCM: u8 = 0x00;

/// Sample-rate table indexed by the low 5 bits of byte 4
pub const SAMPLE_RATES: [u32; 21] = [
    6000, 12000, 24000, 48000, 96000, 192000, 384000, //
    8000, 16000, 32000, 64000, 128000, 256000, 512000, //
    11025, 22050, 44100, 88200, 176400, 352800, 705600,
];

/// Index of 48000 Hz, used for rates missing from the table
pub const FALLBACK_RATE_INDEX: u8 = 3;

/// Table index for a sample rate, falling back to 48 kHz
pub fn sample_rate_index(sample_rate: u32) -> u8 {
    SAMPLE_RATES
        .iter()
        .position(|&r| r == sample_rate)
        .map(|i| i as u8)
        .unwrap_or(FALLBACK_RATE_INDEX)
}

/// Decoded audio packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbanHeader {
    pub sample_rate: u32,
    /// 1..=256
    pub samples_per_channel: u16,
    /// 1..=256
    pub channels: u16,
    /// Raw data-type code (low 3 bits of byte 7)
    pub data_type: u8,
    /// Codec bits as they sit on the wire (byte 7 & 0xF0)
    pub codec: u8,
    /// Sub-protocol bits as they sit on the wire (byte 4 & 0xE0)
    pub sub_protocol: u8,
    pub stream_name: String,
    pub frame_counter: u32,
}

impl VbanHeader {
    /// Header for an outgoing PCM audio frame
    ///
    /// Sample and channel counts are clamped to the 1..=256 the wire
    /// format can carry.
    pub fn audio(
        sample_rate: u32,
        channels: u16,
        samples_per_channel: usize,
        encoding: SampleEncoding,
        stream_name: &str,
        frame_counter: u32,
    ) -> Self {
        Self {
            sample_rate,
            samples_per_channel: samples_per_channel.clamp(1, 256) as u16,
            channels: channels.clamp(1, 256),
            data_type: encoding.code(),
            codec: CODEC_PCM,
            sub_protocol: SUB_PROTOCOL_AUDIO,
            stream_name: stream_name.to_string(),
            frame_counter,
        }
    }

    /// Parse and validate the first 28 bytes of a datagram
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::TooShort(buf.len()));
        }
        if buf[0..4] != MAGIC {
            return Err(CodecError::BadMagic);
        }

        let sr_index = buf[4] & 0x1F;
        let sample_rate = *SAMPLE_RATES
            .get(sr_index as usize)
            .ok_or(CodecError::BadSampleRateIndex(sr_index))?;

        let name_field = &buf[8..8 + STREAM_NAME_LEN];
        let name_len = name_field
            .iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map_or(0, |p| p + 1);
        let stream_name = name_field[..name_len]
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect();

        Ok(Self {
            sample_rate,
            samples_per_channel: buf[5] as u16 + 1,
            channels: buf[6] as u16 + 1,
            data_type: buf[7] & 0x07,
            codec: buf[7] & 0xF0,
            sub_protocol: buf[4] & 0xE0,
            stream_name,
            frame_counter: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }

    /// Serialize into exactly [`HEADER_SIZE`] bytes
    pub fn write<B: BufMut>(&self, out: &mut B) {
        out.put_slice(&MAGIC);
        out.put_u8((self.sub_protocol & 0xE0) | (sample_rate_index(self.sample_rate) & 0x1F));
        out.put_u8((self.samples_per_channel.clamp(1, 256) - 1) as u8);
        out.put_u8((self.channels.clamp(1, 256) - 1) as u8);
        out.put_u8((self.codec & 0xF0) | (self.data_type & 0x07));

        let mut name = [0u8; STREAM_NAME_LEN];
        for (slot, ch) in name.iter_mut().zip(self.stream_name.chars()) {
            *slot = if ch.is_ascii() { ch as u8 } else { b'?' };
        }
        out.put_slice(&name);

        out.put_u32_le(self.frame_counter);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        self.write(&mut &mut bytes[..]);
        bytes
    }

    pub fn is_pcm_audio(&self) -> bool {
        self.sub_protocol == SUB_PROTOCOL_AUDIO && self.codec == CODEC_PCM
    }

    pub fn encoding(&self) -> Option<SampleEncoding> {
        SampleEncoding::from_code(self.data_type)
    }

    /// Stream format, if the data type is one this engine decodes
    pub fn format(&self) -> Option<AudioFormat> {
        self.encoding()
            .map(|enc| AudioFormat::new(self.sample_rate, self.channels, enc))
    }

    /// Case-insensitive stream name match
    pub fn matches_stream(&self, name: &str) -> bool {
        self.stream_name.eq_ignore_ascii_case(name.trim_end_matches(['\0', ' ']))
    }
}

/// Encode a header from its individual fields
pub fn encode_header(
    sample_rate: u32,
    channels: u16,
    samples_per_channel: usize,
    encoding: SampleEncoding,
    stream_name: &str,
    frame_counter: u32,
) -> [u8; HEADER_SIZE] {
    VbanHeader::audio(
        sample_rate,
        channels,
        samples_per_channel,
        encoding,
        stream_name,
        frame_counter,
    )
    .to_bytes()
}

/// Parse a header, `None` on any violation
pub fn try_parse_header(buf: &[u8]) -> Option<VbanHeader> {
    VbanHeader::parse(buf).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_layout() {
        let bytes = encode_header(44100, 2, 256, SampleEncoding::Float32, "ECHO_OUT", 0x0403_0201);

        assert_eq!(&bytes[0..4], b"VBAN");
        assert_eq!(bytes[4], 16);
        assert_eq!(bytes[5], 255);
        assert_eq!(bytes[6], 1);
        assert_eq!(bytes[7], 0x04);
        assert_eq!(&bytes[8..16], b"ECHO_OUT");
        assert!(bytes[16..24].iter().all(|&b| b == 0));
        assert_eq!(&bytes[24..28], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_rate_falls_back_to_48k() {
        assert_eq!(sample_rate_index(47999), FALLBACK_RATE_INDEX);
        let bytes = encode_header(47999, 1, 16, SampleEncoding::Float32, "x", 0);
        assert_eq!(VbanHeader::parse(&bytes).unwrap().sample_rate, 48000);
    }

    #[test]
    fn test_rejects() {
        let good = encode_header(48000, 2, 64, SampleEncoding::Int16, "A", 7);

        assert_eq!(VbanHeader::parse(&good[..27]), Err(CodecError::TooShort(27)));

        let mut bad_magic = good;
        bad_magic[0] = b'X';
        assert_eq!(VbanHeader::parse(&bad_magic), Err(CodecError::BadMagic));

        let mut bad_rate = good;
        bad_rate[4] = 21;
        assert_eq!(
            VbanHeader::parse(&bad_rate),
            Err(CodecError::BadSampleRateIndex(21))
        );

        assert!(try_parse_header(&[]).is_none());
    }

    #[test]
    fn test_name_padding_and_truncation() {
        let mut bytes = encode_header(48000, 2, 1, SampleEncoding::Float32, "MIC", 0);
        bytes[11] = b' ';
        bytes[12] = b' ';
        assert_eq!(VbanHeader::parse(&bytes).unwrap().stream_name, "MIC");

        let long = encode_header(48000, 2, 1, SampleEncoding::Float32, "ABCDEFGHIJKLMNOPQRS", 0);
        assert_eq!(VbanHeader::parse(&long).unwrap().stream_name, "ABCDEFGHIJKLMNOP");
    }

    #[test]
    fn test_stream_match_is_case_insensitive() {
        let h = VbanHeader::parse(&encode_header(48000, 2, 1, SampleEncoding::Float32, "echo_out", 0)).unwrap();
        assert!(h.matches_stream("ECHO_OUT"));
        assert!(!h.matches_stream("OTHER"));
    }

    #[test]
    fn test_sub_protocol_and_codec_bits() {
        let mut bytes = encode_header(48000, 2, 1, SampleEncoding::Float32, "S", 0);
        assert!(VbanHeader::parse(&bytes).unwrap().is_pcm_audio());

        bytes[4] |= 0x20; // serial sub-protocol
        assert!(!VbanHeader::parse(&bytes).unwrap().is_pcm_audio());

        let mut bytes = encode_header(48000, 2, 1, SampleEncoding::Float32, "S", 0);
        bytes[7] |= 0x10; // non-PCM codec
        let h = VbanHeader::parse(&bytes).unwrap();
        assert!(!h.is_pcm_audio());
        assert_eq!(h.encoding(), Some(SampleEncoding::Float32));
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            rate_idx in 0usize..SAMPLE_RATES.len(),
            channels in 1u16..=256,
            spc in 1usize..=256,
            name in "[A-Za-z0-9_]{0,16}",
            counter in any::<u32>(),
        ) {
            let rate = SAMPLE_RATES[rate_idx];
            let bytes = encode_header(rate, channels, spc, SampleEncoding::Float32, &name, counter);
            let h = try_parse_header(&bytes).unwrap();

            prop_assert_eq!(h.sample_rate, rate);
            prop_assert_eq!(h.channels, channels);
            prop_assert_eq!(h.samples_per_channel as usize, spc);
            prop_assert_eq!(h.encoding(), Some(SampleEncoding::Float32));
            prop_assert_eq!(h.stream_name, name);
            prop_assert_eq!(h.frame_counter, counter);
        }
    }
}
