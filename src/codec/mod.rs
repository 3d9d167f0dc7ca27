//! VBAN-compatible stream framing
//!
//! Pure functions over byte buffers: header encode/parse and payload
//! decode. No I/O happens here.

pub mod decoder;
pub mod encoder;
pub mod vban;

pub use decoder::{decode_payload_to_f32, decode_samples};
pub use encoder::{encode_f32_payload, PacketEncoder};
pub use vban::{encode_header, try_parse_header, VbanHeader, HEADER_SIZE};
