//! PCM payload decoding
//!
//! Converts raw little-endian payload bytes in any of the supported
//! encodings to interleaved `f32` in [-1, 1].

use crate::protocol::SampleEncoding;

const INT16_SCALE: f32 = 32768.0;
const INT24_SCALE: f32 = 8_388_608.0; // 2^23
const INT32_SCALE: f32 = 2_147_483_648.0; // 2^31

/// Decode a payload given the wire data-type code.
///
/// Codes this engine does not decode yield an empty vector; callers
/// treat that as "nothing received".
pub fn decode_payload_to_f32(payload: &[u8], data_type: u8) -> Vec<f32> {
    match SampleEncoding::from_code(data_type) {
        Some(encoding) => decode_samples(payload, encoding),
        None => Vec::new(),
    }
}

/// Decode a payload in a known encoding. Trailing partial samples are ignored.
pub fn decode_samples(payload: &[u8], encoding: SampleEncoding) -> Vec<f32> {
    let mut out = Vec::with_capacity(payload.len() / encoding.bytes_per_sample());
    decode_into(payload, encoding, &mut out);
    out
}

/// Append decoded samples to `out`, reusing its allocation
pub fn decode_into(payload: &[u8], encoding: SampleEncoding, out: &mut Vec<f32>) {
    let chunks = payload.chunks_exact(encoding.bytes_per_sample());
    match encoding {
        SampleEncoding::Float32 => {
            out.extend(chunks.map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])));
        }
        SampleEncoding::Int16 => {
            out.extend(chunks.map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / INT16_SCALE));
        }
        SampleEncoding::Int24 => {
            out.extend(chunks.map(|b| int24_to_i32(b[0], b[1], b[2]) as f32 / INT24_SCALE));
        }
        SampleEncoding::Int32 => {
            out.extend(
                chunks.map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / INT32_SCALE),
            );
        }
        SampleEncoding::Float64 => {
            out.extend(chunks.map(|b| {
                let v = f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                v.clamp(-1.0, 1.0) as f32
            }));
        }
    }
}

/// Sign-extend a packed little-endian 24-bit sample
#[inline]
pub fn int24_to_i32(lo: u8, mid: u8, hi: u8) -> i32 {
    // Place the 24 bits at the top of an i32, then arithmetic-shift back down.
    i32::from_le_bytes([0, lo, mid, hi]) >> 8
}
