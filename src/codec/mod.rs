//! Line-oriented wire codec for events.
//!
//! - Encoder: Event → one self-delimited record
//! - Decoder: record → Event, plus a streaming reader for consumers

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_str, DecodeError, RecordReader};
pub use encoder::{encode, encode_to_string, EncodingError};
