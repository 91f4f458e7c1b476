//! Registry configuration
//!
//! Caps for the GOP cache, per-subscriber queue sizing, and the policy
//! applied when a subscriber cannot keep up with the publisher.

/// What to do with a subscriber whose queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlowSubscriberPolicy {
    /// Shed non-keyframe video, keep the subscriber attached
    DropNonKey,
    /// Remove the subscriber once it stays full past the watermark
    Disconnect,
    /// Apply backpressure to the publisher
    Block,
}

/// Configuration for the stream registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each subscriber's packet queue
    ///
    /// At 30fps, 128 packets is about 4 seconds of video.
    pub subscriber_queue_capacity: usize,

    /// Maximum packets cached per GOP
    pub gop_max_packets: usize,

    /// Maximum cached GOP payload bytes per stream
    pub gop_max_bytes: usize,

    /// Policy for subscribers that cannot keep up
    pub slow_subscriber_policy: SlowSubscriberPolicy,

    /// Consecutive full-queue deliveries before `Disconnect` removes a
    /// subscriber
    pub slow_subscriber_watermark: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 128, // ~4 seconds @ 30fps
            gop_max_packets: 512,
            gop_max_bytes: 4 * 1024 * 1024, // 4MB
            slow_subscriber_policy: SlowSubscriberPolicy::Disconnect,
            slow_subscriber_watermark: 8,
        }
    }
}

impl RegistryConfig {
    /// Create a registry config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the subscriber queue capacity
    pub fn subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity;
        self
    }

    /// Set the GOP packet cap
    pub fn gop_max_packets(mut self, max: usize) -> Self {
        self.gop_max_packets = max;
        self
    }

    /// Set the GOP byte cap
    pub fn gop_max_bytes(mut self, max: usize) -> Self {
        self.gop_max_bytes = max;
        self
    }

    /// Set the slow-subscriber policy
    pub fn slow_subscriber_policy(mut self, policy: SlowSubscriberPolicy) -> Self {
        self.slow_subscriber_policy = policy;
        self
    }

    /// Set the slow-subscriber watermark
    pub fn slow_subscriber_watermark(mut self, watermark: u32) -> Self {
        self.slow_subscriber_watermark = watermark;
        self
    }
}
