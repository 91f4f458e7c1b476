//! RTMP handler trait
//!
//! The extension point for applications embedding the relay. Implement this
//! trait to authorize connections, publishes, and plays, and to observe
//! stream lifecycle events. All methods default to accepting everything.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::amf::AmfValue;
use crate::protocol::message::{ConnectParams, PlayParams, PublishParams};
use crate::session::SessionContext;

/// Result of authorization checks
#[derive(Debug, Clone)]
pub enum AuthResult {
    /// Accept the request
    Accept,

    /// Reject the request with a reason
    Reject(String),
}

impl AuthResult {
    /// Check if the result is Accept
    pub fn is_accept(&self) -> bool {
        matches!(self, AuthResult::Accept)
    }
}

/// Handler trait for RTMP applications
///
/// # Example
///
/// ```ignore
/// use rtmp_relay::{AuthResult, RtmpHandler};
/// use rtmp_relay::protocol::message::PublishParams;
/// use rtmp_relay::session::SessionContext;
///
/// struct KeyCheck;
///
/// #[async_trait::async_trait]
/// impl RtmpHandler for KeyCheck {
///     async fn on_publish(&self, _ctx: &SessionContext, params: &PublishParams) -> AuthResult {
///         if params.stream_key.starts_with("valid_") {
///             AuthResult::Accept
///         } else {
///             AuthResult::Reject("Invalid stream key".into())
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait RtmpHandler: Send + Sync + 'static {
    /// Called when a new TCP connection is established
    ///
    /// Return false to immediately close the connection. Use this for
    /// IP-based rate limiting or blocklists.
    async fn on_connection(&self, _ctx: &SessionContext) -> bool {
        true
    }

    /// Called on the RTMP 'connect' command
    ///
    /// Validate the application name, auth tokens in tcUrl, etc.
    async fn on_connect(&self, _ctx: &SessionContext, _params: &ConnectParams) -> AuthResult {
        AuthResult::Accept
    }

    /// Called on the 'publish' command
    ///
    /// This is the main authentication point for publishers.
    async fn on_publish(&self, _ctx: &SessionContext, _params: &PublishParams) -> AuthResult {
        AuthResult::Accept
    }

    /// Called on the 'play' command
    async fn on_play(&self, _ctx: &SessionContext, _params: &PlayParams) -> AuthResult {
        AuthResult::Accept
    }

    /// Called when stream metadata arrives (@setDataFrame/onMetaData)
    async fn on_metadata(&self, _ctx: &SessionContext, _metadata: &HashMap<String, AmfValue>) {}

    /// Called when a publishing session detaches from its stream
    async fn on_publish_stop(&self, _ctx: &SessionContext, _stream_key: &str) {}

    /// Called when the connection closes
    async fn on_disconnect(&self, _ctx: &SessionContext) {}
}

/// A handler that accepts everything and logs lifecycle events
pub struct LoggingHandler;

#[async_trait]
impl RtmpHandler for LoggingHandler {
    async fn on_connection(&self, ctx: &SessionContext) -> bool {
        tracing::info!(
            session_id = ctx.session_id,
            peer = %ctx.peer_addr,
            "New connection"
        );
        true
    }

    async fn on_connect(&self, ctx: &SessionContext, params: &ConnectParams) -> AuthResult {
        tracing::info!(
            session_id = ctx.session_id,
            app = %params.app,
            "Connect request"
        );
        AuthResult::Accept
    }

    async fn on_publish(&self, ctx: &SessionContext, params: &PublishParams) -> AuthResult {
        tracing::info!(
            session_id = ctx.session_id,
            stream_key = %params.stream_key,
            "Publish request"
        );
        AuthResult::Accept
    }

    async fn on_play(&self, ctx: &SessionContext, params: &PlayParams) -> AuthResult {
        tracing::info!(
            session_id = ctx.session_id,
            stream_name = %params.stream_name,
            "Play request"
        );
        AuthResult::Accept
    }

    async fn on_disconnect(&self, ctx: &SessionContext) {
        tracing::info!(session_id = ctx.session_id, "Connection closed");
    }
}
