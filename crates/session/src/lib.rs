//! Session layer for Toasty.
//!
//! A [`Session`] runs one transfer attempt at a time: it creates a peer
//! connection, lets a [`NegotiationCoordinator`] bootstrap it through the
//! relay, and hands the resulting data channel to the chunked sender or
//! receiver. Everything the caller needs to display arrives as
//! [`SessionEvent`]s.

mod negotiation;
mod session;

pub use negotiation::{NegotiationCoordinator, NegotiationEvent, NegotiationRole};
pub use session::{Session, SessionEvent, SessionEvents, TransferArtifact};

use toasty_protocol::constants::DEFAULT_RELAY_PORT;
use toasty_relay_client::RelayError;
use toasty_transfer::{TransferConfig, TransferError};
use toasty_transport::TransportError;

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the signaling relay.
    pub relay_url: String,
    pub transfer: TransferConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: format!("ws://127.0.0.1:{DEFAULT_RELAY_PORT}"),
            transfer: TransferConfig::default(),
        }
    }
}

/// Terminal failures while bootstrapping the peer connection.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("relay refused the request: {0}")]
    Rejected(String),

    #[error("relay connection closed before the peers connected")]
    RelayClosed,

    #[error("peer connection error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors surfaced by a [`Session`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("a transfer attempt is already running")]
    Busy,
}

impl SessionError {
    /// Completed fraction when the transfer stopped part way.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            SessionError::Transfer(e) => e.fraction(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_relay_url_uses_default_port() {
        assert_eq!(SessionConfig::default().relay_url, "ws://127.0.0.1:8765");
    }

    #[test]
    fn fraction_only_for_partial_transfers() {
        let partial = SessionError::Transfer(TransferError::Incomplete { fraction: 0.25 });
        assert_eq!(partial.fraction(), Some(0.25));
        assert_eq!(SessionError::Busy.fraction(), None);
        assert_eq!(
            SessionError::Negotiation(NegotiationError::RelayClosed).to_string(),
            "negotiation failed: relay connection closed before the peers connected"
        );
    }
}
