//! Statistics for RTMP sessions

use std::time::Duration;

/// Session-level statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_received: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Connection duration
    pub duration: Duration,
    /// Video packets received or relayed
    pub video_packets: u64,
    /// Audio packets received or relayed
    pub audio_packets: u64,
    /// Keyframes observed
    pub keyframes: u64,
    /// Inbound bitrate estimate (bits/sec)
    pub bitrate: u64,
}

impl SessionStats {
    /// Create a new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the bitrate estimate from bytes and duration
    pub fn calculate_bitrate(&mut self) {
        let secs = self.duration.as_secs();
        if secs > 0 {
            self.bitrate = (self.bytes_received * 8) / secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitrate_calculation() {
        let mut stats = SessionStats::new();
        stats.bytes_received = 1_000_000;
        stats.duration = Duration::from_secs(8);
        stats.calculate_bitrate();
        assert_eq!(stats.bitrate, 1_000_000);
    }

    #[test]
    fn test_bitrate_zero_duration() {
        let mut stats = SessionStats::new();
        stats.bytes_received = 1_000_000;
        stats.calculate_bitrate();
        assert_eq!(stats.bitrate, 0);
    }
}
