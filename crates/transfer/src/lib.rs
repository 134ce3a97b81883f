//! Chunked, flow-controlled file transfer over a data channel.
//!
//! The [`ChunkedSender`] streams a file as one metadata message, a run of
//! binary chunks, and a completion marker, pausing whenever the channel's
//! buffered amount passes the configured ceiling. The [`ChunkedReceiver`]
//! reassembles the chunks and only hands out a file once the byte count
//! matches what the metadata announced.

mod file;
mod progress;
mod receiver;
mod sender;

pub use file::{OutgoingFile, ReceivedFile, sanitize_file_name};
pub use progress::{ProgressEstimator, TransferProgress, completion_fraction};
pub use receiver::{ChunkedReceiver, ReceiveStep, ReceiverState};
pub use sender::{ChunkedSender, EndHandle, SendOutcome};

use toasty_protocol::constants::{CHUNK_SIZE, MAX_BUFFERED_AMOUNT, READ_SLICE_SIZE};
use toasty_protocol::{FileMetadata, ProtocolError};
use toasty_transport::TransportError;

/// Tuning knobs shared by both ends of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Largest binary message put on the channel.
    pub chunk_size: usize,
    /// The sender stops reading once this many bytes are queued.
    pub max_buffered_amount: usize,
    /// The channel signals "low" when the queue drains to this level.
    pub buffered_low_threshold: usize,
    /// Bytes read from the source per fill step.
    pub read_slice_size: usize,
    /// Minimum progress advance (as a fraction) between receiver reports.
    pub progress_step: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_buffered_amount: MAX_BUFFERED_AMOUNT,
            buffered_low_threshold: MAX_BUFFERED_AMOUNT / 2,
            read_slice_size: READ_SLICE_SIZE,
            progress_step: 0.01,
        }
    }
}

/// Notifications produced while a transfer runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// The receiver learned what is being sent.
    Metadata(FileMetadata),
    Progress(TransferProgress),
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transfer incomplete: {:.1}% received", .fraction * 100.0)]
    Incomplete { fraction: f64 },

    #[error("size mismatch: announced {announced} bytes, received {received}")]
    SizeMismatch { announced: u64, received: u64 },

    #[error("invalid file name: {0}")]
    InvalidFileName(String),
}

impl TransferError {
    /// Completed fraction for errors caused by an early close.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            TransferError::Incomplete { fraction } => Some(*fraction),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_wire_constants() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 16 * 1024);
        assert_eq!(config.max_buffered_amount, 8 * 1024 * 1024);
        assert_eq!(config.buffered_low_threshold, config.max_buffered_amount / 2);
    }

    #[test]
    fn incomplete_error_reports_percentage() {
        let err = TransferError::Incomplete { fraction: 0.4 };
        assert_eq!(err.to_string(), "transfer incomplete: 40.0% received");
        assert_eq!(err.fraction(), Some(0.4));
        assert_eq!(TransferError::InvalidFileName("..".into()).fraction(), None);
    }
}
