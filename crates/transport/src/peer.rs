//! Peer connection capability.

use std::sync::Arc;

use tokio::sync::mpsc;

use toasty_protocol::{IceCandidate, SessionDescription};

use crate::channel::DataChannelHandle;
use crate::{TransportError, TransportFuture};

/// Aggregate connection state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications from a peer connection.
#[derive(Debug)]
pub enum PeerEvent {
    /// A data channel was added and the session must be (re)negotiated.
    NegotiationNeeded,
    /// A local candidate was gathered; `None` marks the end of gathering.
    IceCandidate(Option<IceCandidate>),
    /// The remote peer opened a data channel.
    DataChannel(DataChannelHandle),
    StateChanged(PeerState),
}

/// Queue on which a peer connection delivers its notifications.
pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One peer-to-peer connection.
pub trait PeerConnection: Send + Sync {
    fn create_data_channel(&self, label: &str) -> TransportFuture<'_, DataChannelHandle>;

    fn create_offer(&self) -> TransportFuture<'_, SessionDescription>;

    fn create_answer(&self) -> TransportFuture<'_, SessionDescription>;

    fn set_local_description(&self, description: SessionDescription) -> TransportFuture<'_, ()>;

    fn set_remote_description(&self, description: SessionDescription)
    -> TransportFuture<'_, ()>;

    fn has_remote_description(&self) -> bool;

    /// Applies a remote candidate. Fails if no remote description is set yet.
    fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportFuture<'_, ()>;

    fn connection_state(&self) -> PeerState;

    fn close(&self) -> TransportFuture<'_, ()>;
}

/// Creates fresh peer connections, one per transfer attempt.
pub trait PeerFactory: Send + Sync {
    fn create(&self) -> Result<(Arc<dyn PeerConnection>, PeerEvents), TransportError>;
}
