//! AMF (Action Message Format) implementation
//!
//! AMF is Adobe's binary serialization format used in RTMP for encoding
//! command parameters and metadata. Commands use AMF0 on the wire; AMF3
//! command messages (type 17) wrap an AMF0 body behind a one-byte format
//! marker, which the message layer strips before decoding.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::AmfValue;
