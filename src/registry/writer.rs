//! Subscriber-facing writer handles
//!
//! The registry never touches sockets. Each subscriber hands it a
//! `PacketWriter` that enqueues onto the subscriber session's outbound
//! queue; the session drains the queue onto the wire at its own pace.
//! `try_write` must never block the publisher.
//!
//! Both the registry and the subscriber session hold handles to the same
//! writer, so eviction cannot rely on dropping a reference: the registry
//! calls `close()`, which ends the queue from the sending side and lets
//! the session observe end-of-stream once the backlog drains.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::media::{MediaPacket, MediaType};

/// Delivery failure for a single subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The subscriber's queue is full
    QueueFull,
    /// The subscriber went away or the writer was closed
    Closed,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::QueueFull => write!(f, "Subscriber queue full"),
            WriteError::Closed => write!(f, "Subscriber closed"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Handle through which the registry delivers packets to one subscriber
#[async_trait]
pub trait PacketWriter: Send + Sync {
    /// Stream key this writer is attached to ("app/name")
    fn key(&self) -> &str;

    /// Unique writer ID within the stream
    fn id(&self) -> &str;

    /// Whether this writer has received its initial GOP replay
    fn is_initialised(&self) -> bool;

    /// Mark the initial GOP replay as delivered
    fn mark_initialised(&self);

    /// Detach the writer from its queue
    ///
    /// Already-queued packets drain; afterwards the receiving side
    /// observes end-of-stream and every further write fails with
    /// `Closed`. Idempotent.
    fn close(&self);

    /// Enqueue a packet without blocking
    fn try_write(&self, packet: MediaPacket) -> Result<(), WriteError>;

    /// Enqueue a packet, waiting for queue space
    async fn write(&self, packet: MediaPacket) -> Result<(), WriteError>;
}

/// `PacketWriter` backed by a bounded mpsc channel
///
/// When the queue overflows the writer enters skip mode and sheds
/// non-keyframe video until a keyframe is enqueued again, so the subscriber
/// resumes at a decodable boundary.
pub struct ChannelWriter {
    stream_key: String,
    writer_id: String,
    initialised: AtomicBool,
    skipping: AtomicBool,
    /// Queue sender; `close` takes it so the receiver sees the channel
    /// end even while session-side handles keep the writer itself alive
    tx: Mutex<Option<mpsc::Sender<MediaPacket>>>,
}

impl ChannelWriter {
    /// Create a writer and the receiving half for the subscriber session
    pub fn channel(
        stream_key: impl Into<String>,
        writer_id: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<MediaPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        let writer = Arc::new(Self {
            stream_key: stream_key.into(),
            writer_id: writer_id.into(),
            initialised: AtomicBool::new(false),
            skipping: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });
        (writer, rx)
    }

    fn tx(&self) -> MutexGuard<'_, Option<mpsc::Sender<MediaPacket>>> {
        // The guarded Option stays valid even if a holder panicked.
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn should_skip(&self, packet: &MediaPacket) -> bool {
        // Only non-keyframe video is sheddable; audio gaps are more
        // audible than a frozen frame, and headers must always go through.
        self.skipping.load(Ordering::Relaxed)
            && packet.media_type == MediaType::Video
            && !packet.is_key_frame
            && !packet.is_sequence_header
    }
}

#[async_trait]
impl PacketWriter for ChannelWriter {
    fn key(&self) -> &str {
        &self.stream_key
    }

    fn id(&self) -> &str {
        &self.writer_id
    }

    fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::Relaxed)
    }

    fn mark_initialised(&self) {
        self.initialised.store(true, Ordering::Relaxed);
    }

    fn close(&self) {
        self.tx().take();
    }

    fn try_write(&self, packet: MediaPacket) -> Result<(), WriteError> {
        let tx = match self.tx().clone() {
            Some(tx) => tx,
            None => return Err(WriteError::Closed),
        };

        if self.should_skip(&packet) {
            return Ok(());
        }

        let resumes = packet.media_type == MediaType::Video && packet.is_key_frame;

        match tx.try_send(packet) {
            Ok(()) => {
                if resumes {
                    self.skipping.store(false, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.skipping.store(true, Ordering::Relaxed);
                Err(WriteError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WriteError::Closed),
        }
    }

    async fn write(&self, packet: MediaPacket) -> Result<(), WriteError> {
        let tx = match self.tx().clone() {
            Some(tx) => tx,
            None => return Err(WriteError::Closed),
        };
        tx.send(packet).await.map_err(|_| WriteError::Closed)
    }
}
