//! Media handling for the relay
//!
//! This module provides:
//! - Classification of RTMP audio/video bodies into `MediaPacket`s
//! - GOP caching for late-joiner support

pub mod gop;
pub mod packet;

pub use gop::GopCache;
pub use packet::{AudioFormat, MediaPacket, MediaType, VideoCodec};
