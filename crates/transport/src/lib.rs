//! Transport capabilities consumed by the Toasty core.
//!
//! The peer connection and data channel themselves (ICE, DTLS, SCTP) live
//! outside this workspace. The core only talks to them through the
//! [`PeerConnection`] and [`DataChannel`] traits, and receives their
//! notifications as events on unbounded queues, so no protocol step ever
//! runs inside a transport callback.
//!
//! [`memory`] provides a loopback implementation that pairs peers inside
//! one process, used by tests and local demos.

pub mod channel;
pub mod memory;
pub mod peer;

pub use channel::{
    ChannelEvent, ChannelEvents, ChannelMessage, ChannelState, DataChannel, DataChannelHandle,
};
pub use peer::{PeerConnection, PeerEvent, PeerEvents, PeerFactory, PeerState};

use std::future::Future;
use std::pin::Pin;

/// A boxed future returned by transport methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Errors reported by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("data channel not open: {0:?}")]
    ChannelNotOpen(ChannelState),

    #[error("no remote description set")]
    NoRemoteDescription,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("peer connection closed")]
    PeerClosed,

    #[error("transport failure: {0}")]
    Failed(String),
}
