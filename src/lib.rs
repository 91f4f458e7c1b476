//! rtmp-relay: RTMP ingest-and-relay server
//!
//! This library accepts RTMP client connections, performs the handshake,
//! reassembles the chunk stream into whole messages, interprets the control
//! and command sub-protocols, and relays media from publishers to all
//! attached players through a shared stream registry with GOP caching, so
//! late joiners start at a decodable boundary.
//!
//! # Example: Simple Relay
//!
//! ```no_run
//! use rtmp_relay::{AuthResult, RtmpHandler, RtmpServer, ServerConfig};
//! use rtmp_relay::protocol::message::PublishParams;
//! use rtmp_relay::session::SessionContext;
//!
//! struct MyHandler;
//!
//! #[async_trait::async_trait]
//! impl RtmpHandler for MyHandler {
//!     async fn on_publish(&self, _ctx: &SessionContext, params: &PublishParams) -> AuthResult {
//!         println!("Stream published: {}", params.stream_key);
//!         AuthResult::Accept
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RtmpServer::new(ServerConfig::default(), MyHandler);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod amf;
pub mod error;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use media::{GopCache, MediaPacket, MediaType};
pub use registry::{RegistryConfig, SlowSubscriberPolicy, StreamKey, StreamRegistry};
pub use server::config::ServerConfig;
pub use server::handler::{AuthResult, LoggingHandler, RtmpHandler};
pub use server::listener::RtmpServer;
