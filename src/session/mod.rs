//! RTMP session state management
//!
//! This module manages the state of RTMP connections:
//! - Session lifecycle (handshake phases, connect, publish/play, teardown)
//! - Protocol-control handling and acknowledgement accounting
//! - Context passed to handler callbacks

pub mod context;
pub mod control;
pub mod state;

pub use context::SessionContext;
pub use control::{ack_if_due, handle_control_message, ControlEffect};
pub use state::{SessionPhase, SessionRole, SessionState};
