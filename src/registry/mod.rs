//! Stream registry for publisher/subscriber routing
//!
//! The registry is the only point where sessions interact: one publisher
//! and N subscribers meet under a stream key. Each entry couples the
//! publisher flag, the subscriber writer handles, and the GOP cache that
//! lets late joiners start at a decodable boundary.
//!
//! ```text
//!                        Arc<StreamRegistry>
//!                   ┌───────────────────────────┐
//!                   │ streams: HashMap<key,     │
//!                   │   MediaStream {           │
//!                   │     publisher_exists,     │
//!                   │     subscribers: id->W,   │
//!                   │     gop: GopCache,        │
//!                   │   }                       │
//!                   │ >                         │
//!                   └────────────┬──────────────┘
//!                                │ write_packet
//!            ┌───────────────────┼───────────────────┐
//!            ▼                   ▼                   ▼
//!       [Publisher]        [Subscriber]        [Subscriber]
//!       session            queue -> TCP        queue -> TCP
//! ```
//!
//! An entry exists exactly while it has a publisher or at least one
//! subscriber; the last leaver removes it. Payloads are reference-counted
//! `Bytes`, so fan-out clones packets without copying frame data.

pub mod config;
pub mod writer;

pub use config::{RegistryConfig, SlowSubscriberPolicy};
pub use writer::{ChannelWriter, PacketWriter, WriteError};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::media::{GopCache, MediaPacket};

/// Stream identity: application plus stream name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name/key (e.g., "cam1")
    pub name: String,
}

impl StreamKey {
    /// Create a new stream key
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

/// Error type for registry operations
#[derive(Debug, Clone)]
pub enum RegistryError {
    /// Another session is already publishing to this key
    AlreadyPublishing(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AlreadyPublishing(key) => {
                write!(f, "Stream already has a publisher: {}", key)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry entry for a single stream
struct MediaStream {
    publisher_exists: bool,
    subscribers: HashMap<String, Arc<dyn PacketWriter>>,
    /// Consecutive full-queue deliveries per subscriber
    lag_counts: HashMap<String, u32>,
    gop: GopCache,
}

impl MediaStream {
    fn new(config: &RegistryConfig) -> Self {
        Self {
            publisher_exists: false,
            subscribers: HashMap::new(),
            lag_counts: HashMap::new(),
            gop: GopCache::new(config.gop_max_packets, config.gop_max_bytes),
        }
    }

    fn is_orphaned(&self) -> bool {
        !self.publisher_exists && self.subscribers.is_empty()
    }
}

/// Statistics for a stream
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Number of attached subscribers
    pub subscriber_count: usize,
    /// Whether the stream has a publisher
    pub has_publisher: bool,
    /// Packets in the GOP cache
    pub gop_packets: usize,
    /// Bytes in the GOP cache
    pub gop_bytes: usize,
}

/// Central registry for all active streams
///
/// Shared process-wide via `Arc`; the outer map and each entry are behind
/// `tokio::sync::RwLock`, so every mutating operation on a key is
/// serialised against the others.
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<RwLock<MediaStream>>>>,
    config: RegistryConfig,
}

impl StreamRegistry {
    /// Create a registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a publisher for a stream key
    ///
    /// Creates the entry if absent (subscribers may already be waiting).
    /// Fails if the key already has a publisher.
    pub async fn register_publisher(&self, key: &str) -> Result<(), RegistryError> {
        let mut streams = self.streams.write().await;

        if let Some(entry) = streams.get(key) {
            let mut stream = entry.write().await;
            if stream.publisher_exists {
                return Err(RegistryError::AlreadyPublishing(key.to_string()));
            }
            stream.publisher_exists = true;
            tracing::info!(
                stream = key,
                subscribers = stream.subscribers.len(),
                "Publisher registered (existing stream)"
            );
        } else {
            let mut stream = MediaStream::new(&self.config);
            stream.publisher_exists = true;
            streams.insert(key.to_string(), Arc::new(RwLock::new(stream)));
            tracing::info!(stream = key, "Publisher registered (new stream)");
        }

        Ok(())
    }

    /// Unregister the publisher of a stream key
    ///
    /// Attached subscribers stay registered and observe end-of-stream
    /// through the absence of new packets. The entry is removed only when
    /// no subscribers remain.
    pub async fn remove_publisher(&self, key: &str) {
        let mut streams = self.streams.write().await;

        let Some(entry) = streams.get(key).cloned() else {
            tracing::warn!(stream = key, "Publisher remove for unknown stream");
            return;
        };

        let mut stream = entry.write().await;
        stream.publisher_exists = false;
        // The cached GOP belongs to the departed publisher; a replacement
        // starts fresh at its first keyframe.
        stream.gop.clear();

        tracing::info!(
            stream = key,
            subscribers = stream.subscribers.len(),
            "Publisher removed"
        );

        if stream.is_orphaned() {
            drop(stream);
            streams.remove(key);
            tracing::info!(stream = key, "Stream entry removed (no publisher, no subscribers)");
        }
    }

    /// Attach a subscriber's writer handle, returning the subscriber count
    ///
    /// Creates the entry if absent (subscribers may precede the publisher).
    /// When a publisher already exists the cached GOP is replayed into the
    /// handle before this call returns, so everything delivered afterwards
    /// is newer than the replay.
    pub async fn add_player(&self, handle: Arc<dyn PacketWriter>) -> usize {
        let key = handle.key().to_string();
        let writer_id = handle.id().to_string();

        let mut streams = self.streams.write().await;
        let entry = streams
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(MediaStream::new(&self.config))))
            .clone();
        drop(streams);

        let mut stream = entry.write().await;
        if stream.publisher_exists {
            for packet in stream.gop.catchup_packets() {
                let _ = handle.try_write(packet);
            }
            handle.mark_initialised();
        }
        stream.subscribers.insert(writer_id.clone(), handle);

        let count = stream.subscribers.len();
        tracing::info!(
            stream = %key,
            writer_id = %writer_id,
            subscribers = count,
            "Subscriber added"
        );
        count
    }

    /// Detach a subscriber by writer ID
    pub async fn remove_player(&self, key: &str, writer_id: &str) {
        let mut streams = self.streams.write().await;

        let Some(entry) = streams.get(key).cloned() else {
            tracing::warn!(stream = key, "Subscriber remove for unknown stream");
            return;
        };

        let mut stream = entry.write().await;
        stream.subscribers.remove(writer_id);
        stream.lag_counts.remove(writer_id);
        tracing::debug!(
            stream = key,
            writer_id = writer_id,
            subscribers = stream.subscribers.len(),
            "Subscriber removed"
        );

        if stream.is_orphaned() {
            drop(stream);
            streams.remove(key);
            tracing::info!(stream = key, "Stream entry removed (no publisher, no subscribers)");
        }
    }

    /// Submit a packet from the publisher and fan it out
    ///
    /// Finds or creates the entry for the packet's stream key, feeds the
    /// GOP cache, then delivers to every subscriber. A subscriber that has
    /// not yet been initialised receives the GOP replay instead of the live
    /// packet (the packet is already part of the replay). Removals decided
    /// during the pass are applied after it completes.
    pub async fn write_packet(&self, packet: MediaPacket) {
        let entry = {
            let streams = self.streams.read().await;
            streams.get(&packet.stream_key).cloned()
        };

        let entry = match entry {
            Some(entry) => entry,
            None => {
                let mut streams = self.streams.write().await;
                streams
                    .entry(packet.stream_key.clone())
                    .or_insert_with(|| {
                        let mut stream = MediaStream::new(&self.config);
                        stream.publisher_exists = true;
                        Arc::new(RwLock::new(stream))
                    })
                    .clone()
            }
        };

        let mut stream = entry.write().await;

        if !stream.gop.insert(&packet) {
            tracing::debug!(
                stream = %packet.stream_key,
                cached = stream.gop.len(),
                "GOP cache full, packet not cached"
            );
        }

        // Fan out over a snapshot so a subscriber disappearing mid-pass
        // cannot invalidate the iteration.
        let snapshot: Vec<(String, Arc<dyn PacketWriter>)> = stream
            .subscribers
            .iter()
            .map(|(id, w)| (id.clone(), w.clone()))
            .collect();

        let policy = self.config.slow_subscriber_policy;
        let watermark = self.config.slow_subscriber_watermark;
        let mut to_remove = Vec::new();

        for (id, subscriber) in snapshot {
            if !subscriber.is_initialised() {
                subscriber.mark_initialised();
                for cached in stream.gop.catchup_packets() {
                    let _ = subscriber.try_write(cached);
                }
                continue;
            }

            let result = match policy {
                SlowSubscriberPolicy::Block => subscriber.write(packet.clone()).await,
                _ => subscriber.try_write(packet.clone()),
            };

            match result {
                Ok(()) => {
                    stream.lag_counts.remove(&id);
                }
                Err(WriteError::Closed) => {
                    to_remove.push(id);
                }
                Err(WriteError::QueueFull) => {
                    let count = stream.lag_counts.entry(id.clone()).or_insert(0);
                    *count += 1;
                    if policy == SlowSubscriberPolicy::Disconnect && *count >= watermark {
                        tracing::warn!(
                            stream = %packet.stream_key,
                            writer_id = %id,
                            lagged = *count,
                            "Disconnecting slow subscriber"
                        );
                        // The session holds its own handle to this writer,
                        // so eviction must close the queue explicitly; the
                        // session observes end-of-stream once the backlog
                        // drains and tears the connection down.
                        subscriber.close();
                        to_remove.push(id);
                    }
                }
            }
        }

        for id in &to_remove {
            stream.subscribers.remove(id);
            stream.lag_counts.remove(id);
        }

        if stream.is_orphaned() {
            let key = packet.stream_key.clone();
            drop(stream);
            let mut streams = self.streams.write().await;
            let orphaned = match streams.get(&key) {
                Some(entry) => entry.read().await.is_orphaned(),
                None => false,
            };
            if orphaned {
                streams.remove(&key);
            }
        }
    }

    /// Whether an entry exists for the key
    pub async fn stream_exists(&self, key: &str) -> bool {
        self.streams.read().await.contains_key(key)
    }

    /// Whether the key currently has a publisher
    pub async fn has_publisher(&self, key: &str) -> bool {
        let streams = self.streams.read().await;
        match streams.get(key) {
            Some(entry) => entry.read().await.publisher_exists,
            None => false,
        }
    }

    /// Snapshot of a stream's statistics
    pub async fn stream_stats(&self, key: &str) -> Option<StreamStats> {
        let streams = self.streams.read().await;
        let entry = streams.get(key)?;
        let stream = entry.read().await;
        Some(StreamStats {
            subscriber_count: stream.subscribers.len(),
            has_publisher: stream.publisher_exists,
            gop_packets: stream.gop.len(),
            gop_bytes: stream.gop.bytes(),
        })
    }

    /// Total number of registered streams
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
