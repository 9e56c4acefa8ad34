//! Control-plane messages between viewer and server
//!
//! Control traffic (session setup, viewport moves, latency probes) is small
//! and infrequent, so it uses bincode over serde. Snapshot frames never pass
//! through here; they use the compact format in `net::wire`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::world::object::Viewport;

/// Stable identity of one connected viewer
pub type ViewerId = Uuid;

/// Upper bound for one encoded control message; anything larger is rejected
/// before bincode sees it
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 4096;

/// Messages from viewer to server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Request to start receiving the world
    Hello {
        viewer_name: String,
        viewport: Viewport,
    },
    /// Viewport moved or resized
    ViewportUpdate(Viewport),
    /// Viewer-initiated latency probe
    Ping { nonce: u32, timestamp: u64 },
    /// Answer to a server-initiated probe
    Pong { nonce: u32, timestamp: u64 },
    /// Acknowledge receiving a frame
    FrameAck { tick: u64 },
    /// Orderly disconnect
    Bye,
}

/// Messages from server to viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Session accepted, with the constants the viewer needs up front
    Welcome {
        viewer_id: ViewerId,
        world_width: f32,
        world_height: f32,
        tick_interval_ms: u64,
    },
    /// Session was not accepted
    Rejected { reason: String },
    /// Server-initiated latency probe; the viewer echoes the nonce
    Ping { nonce: u32, timestamp: u64 },
    /// Answer to a viewer-initiated probe
    Pong {
        nonce: u32,
        client_timestamp: u64,
        server_timestamp: u64,
    },
    /// Server is closing the session
    Kicked { reason: String },
}

/// Encode a control message using bincode
/// Uses legacy config for fixed-size integers (stable wire layout)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Decode a control message using bincode
/// Uses legacy config for fixed-size integers (stable wire layout)
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    if data.len() > MAX_CONTROL_MESSAGE_SIZE {
        return Err(DecodeError(format!(
            "control message too large: {} bytes (max {})",
            data.len(),
            MAX_CONTROL_MESSAGE_SIZE
        )));
    }
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(String);
