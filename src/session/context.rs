//! Handler context
//!
//! Read-only view of a session passed to `RtmpHandler` callbacks. For
//! decisions that modify state, handlers use their return values; the
//! context carries no way to reach back into the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::message::ConnectParams;
use crate::stats::SessionStats;

/// Context passed to handler callbacks
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Unique session ID
    pub session_id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    /// Application name (from connect)
    pub app: String,

    /// Connect parameters (after the connect command)
    pub connect_params: Option<Arc<ConnectParams>>,

    /// Session statistics snapshot
    pub stats: SessionStats,
}

impl SessionContext {
    /// Create a new context
    pub fn new(session_id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            session_id,
            peer_addr,
            app: String::new(),
            connect_params: None,
            stats: SessionStats::default(),
        }
    }

    /// Record the connect parameters
    pub fn with_connect(&mut self, params: ConnectParams) {
        self.app = params.app.clone();
        self.connect_params = Some(Arc::new(params));
    }

    /// TC URL from the connect command, if present
    pub fn tc_url(&self) -> Option<&str> {
        self.connect_params.as_ref().and_then(|p| p.tc_url.as_deref())
    }

    /// Flash version string from the connect command, if present
    pub fn flash_ver(&self) -> Option<&str> {
        self.connect_params
            .as_ref()
            .and_then(|p| p.flash_ver.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn make_test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)), 54321)
    }

    #[test]
    fn test_context_new() {
        let addr = make_test_addr();
        let ctx = SessionContext::new(42, addr);

        assert_eq!(ctx.session_id, 42);
        assert_eq!(ctx.peer_addr, addr);
        assert_eq!(ctx.app, "");
        assert!(ctx.connect_params.is_none());
        assert!(ctx.tc_url().is_none());
    }

    #[test]
    fn test_context_with_connect() {
        let addr = make_test_addr();
        let mut ctx = SessionContext::new(1, addr);

        let mut params = ConnectParams::default();
        params.app = "live".to_string();
        params.tc_url = Some("rtmp://localhost/live".to_string());
        params.flash_ver = Some("OBS-Studio/30.0".to_string());

        ctx.with_connect(params);

        assert_eq!(ctx.app, "live");
        assert_eq!(ctx.tc_url(), Some("rtmp://localhost/live"));
        assert_eq!(ctx.flash_ver(), Some("OBS-Studio/30.0"));
    }
}
