//! Protocol-control message handling
//!
//! Types 1-6 arrive on csid 2 / stream 0 and mutate parser parameters
//! in-band. The handlers here are plain functions over `SessionState`;
//! anything that must reach the wire or the chunk decoder travels back to
//! the connection driver as a `ControlEffect`.

use crate::error::Result;
use crate::protocol::message::{RtmpMessage, UserControlEvent};
use crate::session::state::SessionState;

/// Side effect a control message asks the connection driver to apply
#[derive(Debug)]
pub enum ControlEffect {
    /// Update the chunk decoder's inbound chunk size
    SetInboundChunkSize(u32),
    /// Discard the partial message on a chunk stream
    AbortChunkStream(u32),
    /// Send a message to the peer
    Reply(RtmpMessage),
}

/// Handle a protocol-control or user-control message
///
/// Returns the effects to apply, in order. Messages that need no reaction
/// (acknowledgements from the peer, informational user-control events)
/// produce none.
pub fn handle_control_message(
    state: &mut SessionState,
    message: &RtmpMessage,
) -> Result<Vec<ControlEffect>> {
    let mut effects = Vec::new();

    match message {
        RtmpMessage::SetChunkSize(size) => {
            tracing::debug!(session_id = state.id, size = size, "Peer set chunk size");
            state.in_chunk_size = *size;
            effects.push(ControlEffect::SetInboundChunkSize(*size));
        }

        RtmpMessage::Abort { csid } => {
            tracing::debug!(session_id = state.id, csid = csid, "Peer aborted chunk stream");
            effects.push(ControlEffect::AbortChunkStream(*csid));
        }

        RtmpMessage::Acknowledgement { sequence } => {
            // Informational: the peer's received-byte count.
            tracing::trace!(session_id = state.id, sequence = sequence, "Peer acknowledgement");
        }

        RtmpMessage::WindowAckSize(size) => {
            tracing::debug!(session_id = state.id, size = size, "Peer window ack size");
            state.window_ack_size = *size;
        }

        RtmpMessage::SetPeerBandwidth { size, limit_type: _ } => {
            // Answer with our window if the peer asks for a different one.
            if *size != state.window_ack_size {
                effects.push(ControlEffect::Reply(RtmpMessage::WindowAckSize(*size)));
            }
        }

        RtmpMessage::UserControl(event) => match event {
            UserControlEvent::PingRequest(timestamp) => {
                effects.push(ControlEffect::Reply(RtmpMessage::UserControl(
                    UserControlEvent::PingResponse(*timestamp),
                )));
            }
            UserControlEvent::SetBufferLength { stream_id, buffer_ms } => {
                tracing::trace!(
                    session_id = state.id,
                    stream_id = stream_id,
                    buffer_ms = buffer_ms,
                    "Peer buffer length"
                );
            }
            _ => {}
        },

        _ => {}
    }

    Ok(effects)
}

/// Emit an Acknowledgement if the unacknowledged span reached the window
///
/// Called after every fully assembled message. The sequence number is the
/// total byte count, so consecutive acknowledgements are monotonically
/// non-decreasing.
pub fn ack_if_due(state: &mut SessionState) -> Option<RtmpMessage> {
    if !state.ack_due() {
        return None;
    }

    let sequence = state.bytes_received as u32;
    state.mark_ack_sent();
    Some(RtmpMessage::Acknowledgement { sequence })
}
