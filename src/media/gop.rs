//! GOP (Group of Pictures) cache for late-joiner support
//!
//! A subscriber attaching mid-stream needs, in order:
//! 1. The sequence headers (SPS/PPS for video, AudioSpecificConfig for audio)
//! 2. The most recent keyframe
//! 3. Every frame since that keyframe
//!
//! so its decoder can start at a decodable boundary instead of waiting for
//! the next keyframe.
//!
//! Retention is single-GOP: a new keyframe clears the cache and starts a
//! fresh GOP. Within a GOP nothing is evicted; once the packet or byte cap
//! is reached further packets are refused until the next keyframe resets
//! the cache (evicting mid-GOP would leave a sequence that no longer starts
//! at a decodable frame).

use std::collections::VecDeque;

use super::packet::{MediaPacket, MediaType};

/// Cache of the current GOP plus out-of-band codec-init packets
#[derive(Debug)]
pub struct GopCache {
    /// Maximum number of cached packets
    max_packets: usize,
    /// Maximum cached payload bytes
    max_bytes: usize,
    current_bytes: usize,
    /// Most recent video sequence header
    video_header: Option<MediaPacket>,
    /// Most recent audio sequence header
    audio_header: Option<MediaPacket>,
    /// Most recent stream metadata (onMetaData)
    metadata: Option<MediaPacket>,
    /// Packets since the last keyframe, in arrival order
    packets: VecDeque<MediaPacket>,
    /// Whether the cached run starts at a video keyframe
    starts_at_keyframe: bool,
}

impl GopCache {
    /// Create a cache with the given packet and byte ceilings
    pub fn new(max_packets: usize, max_bytes: usize) -> Self {
        Self {
            max_packets,
            max_bytes,
            current_bytes: 0,
            video_header: None,
            audio_header: None,
            metadata: None,
            packets: VecDeque::new(),
            starts_at_keyframe: false,
        }
    }

    /// Insert a packet from the publisher
    ///
    /// Sequence headers and metadata go to their out-of-band slots. A video
    /// keyframe clears the cache and starts a new GOP. Returns false when
    /// the packet was refused because the current GOP hit a ceiling.
    pub fn insert(&mut self, packet: &MediaPacket) -> bool {
        match packet.media_type {
            MediaType::Metadata => {
                self.metadata = Some(packet.clone());
                return true;
            }
            MediaType::Video if packet.is_sequence_header => {
                self.video_header = Some(packet.clone());
                return true;
            }
            MediaType::Audio if packet.is_sequence_header => {
                self.audio_header = Some(packet.clone());
                return true;
            }
            _ => {}
        }

        if packet.media_type == MediaType::Video && packet.is_key_frame {
            self.clear_packets();
            self.starts_at_keyframe = true;
        }

        if self.packets.len() >= self.max_packets
            || self.current_bytes + packet.size() > self.max_bytes
        {
            return false;
        }

        self.current_bytes += packet.size();
        self.packets.push_back(packet.clone());
        true
    }

    /// Clear cached packets, keeping headers and metadata
    pub fn clear_packets(&mut self) {
        self.packets.clear();
        self.current_bytes = 0;
        self.starts_at_keyframe = false;
    }

    /// Clear everything, including headers and metadata
    pub fn clear(&mut self) {
        self.clear_packets();
        self.video_header = None;
        self.audio_header = None;
        self.metadata = None;
    }

    /// Whether the cached run begins at a video keyframe
    pub fn starts_at_keyframe(&self) -> bool {
        self.starts_at_keyframe
    }

    /// Packets to replay to a newly attached subscriber, in order:
    /// metadata, video sequence header, audio sequence header, then the
    /// cached GOP in arrival order.
    pub fn catchup_packets(&self) -> Vec<MediaPacket> {
        let mut out = Vec::with_capacity(self.packets.len() + 3);

        if let Some(meta) = &self.metadata {
            out.push(meta.clone());
        }
        if let Some(header) = &self.video_header {
            out.push(header.clone());
        }
        if let Some(header) = &self.audio_header {
            out.push(header.clone());
        }
        out.extend(self.packets.iter().cloned());
        out
    }

    /// Number of cached GOP packets (headers excluded)
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Whether the GOP run is empty (headers may still be cached)
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Cached GOP payload bytes
    pub fn bytes(&self) -> usize {
        self.current_bytes
    }

    /// Timestamp span of the cached GOP in milliseconds
    pub fn duration(&self) -> Option<u32> {
        let first = self.packets.front()?.dts;
        let last = self.packets.back()?.dts;
        Some(last.wrapping_sub(first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video(ts: u32, keyframe: bool, extra: usize) -> MediaPacket {
        let mut data = vec![0u8; 5 + extra];
        data[0] = if keyframe { 0x17 } else { 0x27 };
        data[1] = 0x01; // NALU
        MediaPacket::video("live/test", ts, Bytes::from(data))
    }

    fn video_header() -> MediaPacket {
        MediaPacket::video("live/test", 0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0]))
    }

    fn audio(ts: u32) -> MediaPacket {
        MediaPacket::audio("live/test", ts, Bytes::from_static(&[0xAF, 0x01, 0x21]))
    }

    fn audio_header() -> MediaPacket {
        MediaPacket::audio("live/test", 0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]))
    }

    #[test]
    fn test_headers_cached_out_of_band() {
        let mut cache = GopCache::new(64, 1 << 20);

        cache.insert(&video_header());
        cache.insert(&audio_header());
        assert_eq!(cache.len(), 0);

        let catchup = cache.catchup_packets();
        assert_eq!(catchup.len(), 2);
        assert!(catchup[0].is_sequence_header);
        assert_eq!(catchup[0].media_type, MediaType::Video);
        assert_eq!(catchup[1].media_type, MediaType::Audio);
    }

    #[test]
    fn test_keyframe_starts_new_gop() {
        let mut cache = GopCache::new(64, 1 << 20);

        cache.insert(&video(0, true, 10));
        cache.insert(&audio(10));
        cache.insert(&video(33, false, 10));
        assert_eq!(cache.len(), 3);
        assert!(cache.starts_at_keyframe());

        // New keyframe drops the old GOP.
        cache.insert(&video(66, true, 10));
        assert_eq!(cache.len(), 1);
        assert!(cache.packets[0].is_key_frame);
    }

    #[test]
    fn test_replay_order() {
        let mut cache = GopCache::new(64, 1 << 20);

        cache.insert(&video(0, true, 10));
        cache.insert(&video_header());
        cache.insert(&audio_header());
        cache.insert(&audio(5));
        cache.insert(&video(33, false, 10));

        let catchup = cache.catchup_packets();
        // Headers first regardless of arrival order, then the GOP run.
        assert!(catchup[0].is_sequence_header);
        assert!(catchup[1].is_sequence_header);
        assert!(catchup[2].is_key_frame);
        assert_eq!(catchup[3].media_type, MediaType::Audio);
        assert_eq!(catchup[4].dts, 33);
    }

    #[test]
    fn test_caps_refuse_mid_gop() {
        let mut cache = GopCache::new(2, 1 << 20);

        assert!(cache.insert(&video(0, true, 10)));
        assert!(cache.insert(&video(33, false, 10)));
        // Cap reached: refuse, do not evict the keyframe.
        assert!(!cache.insert(&video(66, false, 10)));
        assert_eq!(cache.len(), 2);
        assert!(cache.packets[0].is_key_frame);

        // Next keyframe resets the cache and is accepted again.
        assert!(cache.insert(&video(100, true, 10)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_byte_ceiling() {
        let mut cache = GopCache::new(64, 64);

        assert!(cache.insert(&video(0, true, 20))); // 25 bytes
        assert!(cache.insert(&video(33, false, 20))); // 50 bytes
        assert!(!cache.insert(&video(66, false, 20))); // would exceed 64
        assert_eq!(cache.bytes(), 50);
    }

    #[test]
    fn test_duration() {
        let mut cache = GopCache::new(64, 1 << 20);
        cache.insert(&video(100, true, 0));
        cache.insert(&video(133, false, 0));
        cache.insert(&video(166, false, 0));
        assert_eq!(cache.duration(), Some(66));
    }
}
