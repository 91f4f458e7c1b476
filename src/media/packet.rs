//! Media packets relayed between publishers and subscribers
//!
//! RTMP audio/video messages are FLV tag bodies without the tag header. The
//! first byte or two carry everything the relay needs to know: frame type,
//! codec, and whether the packet is a codec-initialisation sequence header.
//!
//! ```text
//! Video body:
//! +----------+----------+
//! | FrameType| CodecID  | AVCPacketType(1) | CompositionTime(3) | Data...
//! | (4 bits) | (4 bits) |   (AVC/HEVC only)
//! +----------+----------+
//!
//! Audio body:
//! +-----------+---------+---------+---------+
//! |SoundFormat|SoundRate|SoundSize|SoundType | AACPacketType(1) | Data...
//! | (4 bits)  | (2 bits)| (1 bit) | (1 bit)  |   (AAC only)
//! +-----------+---------+---------+---------+
//! ```

use bytes::Bytes;

/// Kind of media carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Metadata,
}

/// Video codec ID (lower 4 bits of the first video byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    Avc = 7,
    Hevc = 12,
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    /// Whether the codec wraps its payload in AVC-style packets
    /// (packet-type byte + composition time)
    pub fn has_avc_packaging(&self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc)
    }
}

/// Audio format (upper 4 bits of the first audio byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    G711ALaw = 7,
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b >> 4 {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }
}

/// One media packet flowing through the registry
///
/// Immutable after creation. The payload is reference-counted, so cloning a
/// packet for fan-out shares the frame data.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Stream key ("app/name") the packet belongs to
    pub stream_key: String,
    /// Kind of media
    pub media_type: MediaType,
    /// Raw codec nibble from the FLV byte (format for audio, codec ID for video)
    pub codec: u8,
    /// Video keyframe (seekable frame)
    pub is_key_frame: bool,
    /// Codec-initialisation packet (AVC config / AudioSpecificConfig)
    pub is_sequence_header: bool,
    /// Decode timestamp (milliseconds)
    pub dts: u32,
    /// Presentation timestamp (dts + composition offset for AVC-packaged video)
    pub pts: u32,
    /// Raw message body as received
    pub payload: Bytes,
}

impl MediaPacket {
    /// Classify a video message body
    pub fn video(stream_key: impl Into<String>, timestamp: u32, payload: Bytes) -> Self {
        let first = payload.first().copied().unwrap_or(0);
        let is_key_frame = (first >> 4) == 1;
        let codec = first & 0x0F;

        let avc_packaged = VideoCodec::from_byte(first)
            .map(|c| c.has_avc_packaging())
            .unwrap_or(false);
        let is_sequence_header =
            avc_packaged && payload.len() >= 2 && is_key_frame && payload[1] == 0;

        // AVC-packaged frames carry a signed 24-bit composition offset.
        let pts = if avc_packaged && !is_sequence_header && payload.len() >= 5 {
            let raw = ((payload[2] as i32) << 16) | ((payload[3] as i32) << 8) | (payload[4] as i32);
            let cts = if raw & 0x80_0000 != 0 { raw - 0x100_0000 } else { raw };
            timestamp.wrapping_add(cts as u32)
        } else {
            timestamp
        };

        Self {
            stream_key: stream_key.into(),
            media_type: MediaType::Video,
            codec,
            is_key_frame,
            is_sequence_header,
            dts: timestamp,
            pts,
            payload,
        }
    }

    /// Classify an audio message body
    pub fn audio(stream_key: impl Into<String>, timestamp: u32, payload: Bytes) -> Self {
        let first = payload.first().copied().unwrap_or(0);
        let is_aac = (first >> 4) == AudioFormat::Aac as u8;
        let is_sequence_header = is_aac && payload.len() >= 2 && payload[1] == 0;

        Self {
            stream_key: stream_key.into(),
            media_type: MediaType::Audio,
            codec: first >> 4,
            is_key_frame: false,
            is_sequence_header,
            dts: timestamp,
            pts: timestamp,
            payload,
        }
    }

    /// Wrap a metadata (onMetaData) body
    pub fn metadata(stream_key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            stream_key: stream_key.into(),
            media_type: MediaType::Metadata,
            codec: 0,
            is_key_frame: false,
            is_sequence_header: false,
            dts: 0,
            pts: 0,
            payload,
        }
    }

    /// Parsed video codec, for video packets
    pub fn video_codec(&self) -> Option<VideoCodec> {
        match self.media_type {
            MediaType::Video => VideoCodec::from_byte(self.codec),
            _ => None,
        }
    }

    /// Parsed audio format, for audio packets
    pub fn audio_format(&self) -> Option<AudioFormat> {
        match self.media_type {
            MediaType::Audio => AudioFormat::from_byte(self.codec << 4),
            _ => None,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_keyframe_classification() {
        // 0x17 = keyframe + AVC, packet type 1 (NALU), cts = 0
        let pkt = MediaPacket::video(
            "live/cam1",
            40,
            Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00, 0xAA]),
        );
        assert_eq!(pkt.media_type, MediaType::Video);
        assert!(pkt.is_key_frame);
        assert!(!pkt.is_sequence_header);
        assert_eq!(pkt.video_codec(), Some(VideoCodec::Avc));
        assert_eq!(pkt.dts, 40);
        assert_eq!(pkt.pts, 40);

        // 0x27 = inter frame + AVC
        let pkt = MediaPacket::video(
            "live/cam1",
            80,
            Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00, 0xBB]),
        );
        assert!(!pkt.is_key_frame);
    }

    #[test]
    fn test_video_sequence_header() {
        // 0x17 keyframe + AVC, packet type 0 = sequence header
        let pkt = MediaPacket::video("live/cam1", 0, Bytes::from_static(&[0x17, 0x00, 0x00, 0x00, 0x00]));
        assert!(pkt.is_sequence_header);
        assert!(pkt.is_key_frame);
    }

    #[test]
    fn test_video_composition_offset() {
        // cts = 80 -> pts = dts + 80
        let pkt = MediaPacket::video(
            "live/cam1",
            1000,
            Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x50, 0xCC]),
        );
        assert_eq!(pkt.dts, 1000);
        assert_eq!(pkt.pts, 1080);

        // Negative cts (-16) encoded as signed 24-bit
        let pkt = MediaPacket::video(
            "live/cam1",
            1000,
            Bytes::from_static(&[0x27, 0x01, 0xFF, 0xFF, 0xF0, 0xCC]),
        );
        assert_eq!(pkt.pts, 984);
    }

    #[test]
    fn test_audio_classification() {
        // 0xAF = AAC, packet type 0 = AudioSpecificConfig
        let pkt = MediaPacket::audio("live/cam1", 0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert_eq!(pkt.media_type, MediaType::Audio);
        assert!(pkt.is_sequence_header);
        assert_eq!(pkt.audio_format(), Some(AudioFormat::Aac));

        // AAC raw frame
        let pkt = MediaPacket::audio("live/cam1", 23, Bytes::from_static(&[0xAF, 0x01, 0x21]));
        assert!(!pkt.is_sequence_header);

        // MP3 has no sequence-header concept
        let pkt = MediaPacket::audio("live/cam1", 0, Bytes::from_static(&[0x2F, 0x00]));
        assert!(!pkt.is_sequence_header);
        assert_eq!(pkt.audio_format(), Some(AudioFormat::Mp3));
    }

    #[test]
    fn test_empty_payload_does_not_panic() {
        let pkt = MediaPacket::video("live/cam1", 0, Bytes::new());
        assert!(!pkt.is_key_frame);
        assert!(!pkt.is_sequence_header);
    }
}
