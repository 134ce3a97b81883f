//! Signaling relay for Toasty.
//!
//! Accepts any number of WebSocket connections, groups them into rooms
//! identified by short random ids, and forwards session descriptions and
//! ICE candidates between the sender and the receiver of each room. The
//! relay never sees file data: once the peers are connected it is idle.

mod connection;
mod handler;
mod registry;
mod server;

pub use connection::{ConnId, RelayConnection, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use registry::{Delivery, RoomRegistry, Rooms};
pub use server::{RelayServer, ServerConfig};

/// Outbound queue capacity per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("server already running")]
    AlreadyRunning,
}
