//! Wire protocol shared by Toasty peers and the signaling relay.
//!
//! Two protocols live here:
//!
//! - the relay protocol ([`relay`]): JSON control messages exchanged with
//!   the relay over a persistent WebSocket, used to bootstrap a direct
//!   peer connection;
//! - the data-channel control messages ([`control`]): the file metadata
//!   sent before the binary chunks and the completion marker sent after.

pub mod constants;
pub mod control;
pub mod relay;
pub mod types;

pub use control::{CompletionMarker, ControlMessage, FileMetadata};
pub use relay::{DescriptionUpdate, IceUpdate, RelayMessage, RelayRequest, RoomRef};
pub use types::{IceCandidate, PeerRole, RoomId, SdpType, SessionDescription};

/// Errors produced while decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected control message: {0}")]
    UnexpectedControl(String),
}
