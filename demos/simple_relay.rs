//! Simple RTMP relay example with pub/sub support
//!
//! Run with: cargo run --example simple_relay
//!
//! ## Publishing (send stream)
//!
//! With OBS:
//!   Server: rtmp://localhost/live
//!   Stream Key: test
//!
//! With ffmpeg:
//!   ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test
//!
//! ## Playing (receive stream)
//!
//! With ffplay:
//!   ffplay rtmp://localhost/live/test

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rtmp_relay::protocol::message::{ConnectParams, PlayParams, PublishParams};
use rtmp_relay::session::SessionContext;
use rtmp_relay::{AuthResult, RtmpHandler, RtmpServer, ServerConfig};

/// Handler that logs events and counts streams
struct RelayHandler {
    publishes: AtomicU64,
    plays: AtomicU64,
}

impl RelayHandler {
    fn new() -> Self {
        Self {
            publishes: AtomicU64::new(0),
            plays: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl RtmpHandler for RelayHandler {
    async fn on_connection(&self, ctx: &SessionContext) -> bool {
        println!("[{}] New connection from {}", ctx.session_id, ctx.peer_addr);
        true
    }

    async fn on_connect(&self, ctx: &SessionContext, params: &ConnectParams) -> AuthResult {
        println!(
            "[{}] Connect: app={}, tcUrl={:?}",
            ctx.session_id, params.app, params.tc_url
        );
        AuthResult::Accept
    }

    async fn on_publish(&self, ctx: &SessionContext, params: &PublishParams) -> AuthResult {
        let n = self.publishes.fetch_add(1, Ordering::Relaxed) + 1;
        println!(
            "[{}] Publish #{}: key={} type={}",
            ctx.session_id, n, params.stream_key, params.publish_type
        );
        AuthResult::Accept
    }

    async fn on_play(&self, ctx: &SessionContext, params: &PlayParams) -> AuthResult {
        let n = self.plays.fetch_add(1, Ordering::Relaxed) + 1;
        println!(
            "[{}] Play #{}: stream={}",
            ctx.session_id, n, params.stream_name
        );
        AuthResult::Accept
    }

    async fn on_publish_stop(&self, ctx: &SessionContext, stream_key: &str) {
        println!("[{}] Publish stopped: {}", ctx.session_id, stream_key);
    }

    async fn on_disconnect(&self, ctx: &SessionContext) {
        println!("[{}] Disconnected", ctx.session_id);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_relay=debug".parse()?),
        )
        .init();

    let config = ServerConfig::default();

    println!("Starting RTMP relay on {}", config.listen_addr);
    println!();
    println!("=== Publish a stream ===");
    println!("OBS:    Server: rtmp://localhost/live  Stream Key: test");
    println!("ffmpeg: ffmpeg -re -i input.mp4 -c copy -f flv rtmp://localhost/live/test");
    println!();
    println!("=== Play a stream ===");
    println!("ffplay: ffplay rtmp://localhost/live/test");
    println!();

    let server = RtmpServer::new(config, RelayHandler::new());

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("\nShutting down...");
        })
        .await?;

    Ok(())
}
