//! Receiving side: reassembles chunks and verifies the byte count.
//!
//! [`ReceiverState`] is the synchronous state machine
//! (`awaiting_metadata -> receiving_data -> complete`); [`ChunkedReceiver`]
//! drives it from a channel's event queue.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use toasty_protocol::constants::DEFAULT_MIME_TYPE;
use toasty_protocol::{ControlMessage, FileMetadata, ProtocolError};
use toasty_transport::{ChannelEvent, ChannelEvents, ChannelMessage, DataChannel, DataChannelHandle};

use crate::file::ReceivedFile;
use crate::progress::{ProgressEstimator, TransferProgress, completion_fraction};
use crate::{TransferConfig, TransferError, TransferEvent};

/// What one inbound message did to the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiveStep {
    /// Metadata arrived; data follows.
    Metadata(FileMetadata),
    /// Data was appended and progress advanced past the report step.
    Progress(TransferProgress),
    /// Data was appended; nothing to report yet.
    Data,
    /// The marker arrived with the byte count matching.
    Complete(ReceivedFile),
}

enum Phase {
    AwaitingMetadata,
    Receiving {
        metadata: FileMetadata,
        data: Vec<u8>,
        estimator: ProgressEstimator,
        last_reported: f64,
    },
    Complete,
}

/// Receiver state machine, independent of any channel.
pub struct ReceiverState {
    phase: Phase,
    progress_step: f64,
}

impl ReceiverState {
    pub fn new(progress_step: f64) -> Self {
        Self {
            phase: Phase::AwaitingMetadata,
            progress_step,
        }
    }

    /// Bytes accumulated so far.
    pub fn received(&self) -> u64 {
        match &self.phase {
            Phase::Receiving { data, .. } => data.len() as u64,
            _ => 0,
        }
    }

    /// Fraction of the announced size received so far.
    pub fn fraction(&self) -> f64 {
        match &self.phase {
            Phase::Receiving { metadata, data, .. } if metadata.size > 0 => {
                completion_fraction(data.len() as u64, metadata.size)
            }
            Phase::Complete => 1.0,
            _ => 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete)
    }

    /// Feeds one inbound message.
    ///
    /// A message is treated as control JSON before the metadata and once the
    /// accumulated count has reached the announced size; in between, binary
    /// messages are file data. Decode errors leave the state untouched.
    pub fn on_message(&mut self, message: ChannelMessage) -> Result<ReceiveStep, TransferError> {
        match &mut self.phase {
            Phase::Complete => Err(ProtocolError::UnexpectedControl(
                "message after completion".into(),
            )
            .into()),

            Phase::AwaitingMetadata => match ControlMessage::decode(message.as_bytes())? {
                ControlMessage::Metadata(metadata) => {
                    debug!(name = %metadata.name, size = metadata.size, "metadata received");
                    self.phase = Phase::Receiving {
                        estimator: ProgressEstimator::new(metadata.size),
                        data: Vec::with_capacity(initial_capacity(metadata.size)),
                        metadata: metadata.clone(),
                        last_reported: 0.0,
                    };
                    Ok(ReceiveStep::Metadata(metadata))
                }
                ControlMessage::Done(marker) if marker.size == 0 => {
                    self.phase = Phase::Complete;
                    Ok(ReceiveStep::Complete(ReceivedFile {
                        metadata: FileMetadata {
                            name: String::new(),
                            mime_type: DEFAULT_MIME_TYPE.into(),
                            size: 0,
                        },
                        data: Vec::new(),
                    }))
                }
                ControlMessage::Done(marker) => Err(ProtocolError::UnexpectedControl(format!(
                    "completion marker for {} bytes before metadata",
                    marker.size
                ))
                .into()),
            },

            Phase::Receiving {
                metadata,
                data,
                estimator,
                last_reported,
            } => {
                let announced = metadata.size;
                let received = data.len() as u64;

                if received < announced {
                    match message {
                        ChannelMessage::Binary(chunk) => {
                            data.extend_from_slice(&chunk);
                            let progress = estimator.estimate(data.len() as u64);
                            let fraction = progress.fraction();
                            // Tolerate float noise so each step fires exactly once.
                            if fraction - *last_reported >= self.progress_step - 1e-9 {
                                *last_reported = fraction;
                                return Ok(ReceiveStep::Progress(progress));
                            }
                            return Ok(ReceiveStep::Data);
                        }
                        ChannelMessage::Text(text) => {
                            return match ControlMessage::decode(text.as_bytes())? {
                                ControlMessage::Done(marker) => {
                                    warn!(
                                        announced,
                                        received,
                                        marker = marker.size,
                                        "completion marker before all data arrived"
                                    );
                                    Err(TransferError::Incomplete {
                                        fraction: completion_fraction(received, announced),
                                    })
                                }
                                ControlMessage::Metadata(_) => {
                                    Err(ProtocolError::UnexpectedControl(
                                        "second metadata message".into(),
                                    )
                                    .into())
                                }
                            };
                        }
                    }
                }

                match ControlMessage::decode(message.as_bytes())? {
                    ControlMessage::Done(marker) => {
                        if received != announced {
                            return Err(TransferError::SizeMismatch { announced, received });
                        }
                        if marker.size != received {
                            warn!(
                                marker = marker.size,
                                received, "completion marker disagrees with received size"
                            );
                        }
                        let file = ReceivedFile {
                            metadata: metadata.clone(),
                            data: std::mem::take(data),
                        };
                        self.phase = Phase::Complete;
                        Ok(ReceiveStep::Complete(file))
                    }
                    ControlMessage::Metadata(_) => Err(ProtocolError::UnexpectedControl(
                        "metadata after file data".into(),
                    )
                    .into()),
                }
            }
        }
    }
}

/// Caps the up-front allocation; the announced size is remote input.
fn initial_capacity(announced: u64) -> usize {
    const MAX_PREALLOC: u64 = 64 * 1024 * 1024;
    announced.min(MAX_PREALLOC) as usize
}

/// Receives one file from one data channel.
pub struct ChunkedReceiver {
    channel: Arc<dyn DataChannel>,
    events: ChannelEvents,
    config: TransferConfig,
}

impl ChunkedReceiver {
    pub fn new(handle: DataChannelHandle, config: TransferConfig) -> Self {
        Self {
            channel: handle.channel,
            events: handle.events,
            config,
        }
    }

    /// Runs until the file is complete or the channel closes.
    ///
    /// On success the channel is closed, which tells the sender the file
    /// arrived. An early close yields [`TransferError::Incomplete`].
    pub async fn receive(
        mut self,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<ReceivedFile, TransferError> {
        let mut state = ReceiverState::new(self.config.progress_step);

        while let Some(event) = self.events.recv().await {
            let message = match event {
                ChannelEvent::Message(message) => message,
                ChannelEvent::Closed => break,
                ChannelEvent::Open | ChannelEvent::BufferedAmountLow => continue,
            };

            match state.on_message(message) {
                Ok(ReceiveStep::Metadata(metadata)) => {
                    info!(name = %metadata.name, size = metadata.size, "receiving file");
                    let _ = events.send(TransferEvent::Metadata(metadata));
                }
                Ok(ReceiveStep::Progress(progress)) => {
                    let _ = events.send(TransferEvent::Progress(progress));
                }
                Ok(ReceiveStep::Data) => {}
                Ok(ReceiveStep::Complete(file)) => {
                    let total = file.metadata.size;
                    let _ = events.send(TransferEvent::Progress(TransferProgress {
                        percent: 100.0,
                        eta: Some(std::time::Duration::ZERO),
                        bytes: total,
                        total,
                    }));
                    info!(name = %file.metadata.name, bytes = file.len(), "file received");
                    let _ = self.channel.close().await;
                    return Ok(file);
                }
                Err(TransferError::Protocol(e)) => {
                    warn!("ignoring undecodable data-channel message: {e}");
                }
                Err(e) => {
                    let _ = self.channel.close().await;
                    return Err(e);
                }
            }
        }

        let fraction = state.fraction();
        info!(
            received = state.received(),
            fraction, "channel closed before the file completed"
        );
        Err(TransferError::Incomplete { fraction })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toasty_protocol::CompletionMarker;
    use toasty_transport::memory::channel_pair;

    fn metadata(size: u64) -> ChannelMessage {
        let meta = FileMetadata {
            name: "f.bin".into(),
            mime_type: "application/octet-stream".into(),
            size,
        };
        ChannelMessage::Text(ControlMessage::Metadata(meta).encode().unwrap())
    }

    fn marker(size: u64) -> ChannelMessage {
        ChannelMessage::Text(ControlMessage::Done(CompletionMarker::new(size)).encode().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn huge_announced_size_keeps_receiving() {
        let mut state = ReceiverState::new(0.01);
        state.on_message(metadata(u64::MAX)).unwrap();
        tokio::time::advance(std::time::Duration::from_secs(2)).await;

        let step = state.on_message(ChannelMessage::Binary(vec![0; 1])).unwrap();
        assert!(matches!(step, ReceiveStep::Data));
        assert_eq!(state.received(), 1);
        assert!(!state.is_complete());
    }

    #[tokio::test]
    async fn state_machine_assembles_in_order() {
        let mut state = ReceiverState::new(0.01);
        assert!(matches!(
            state.on_message(metadata(10)).unwrap(),
            ReceiveStep::Metadata(_)
        ));
        state.on_message(ChannelMessage::Binary(vec![1; 4])).unwrap();
        assert_eq!(state.received(), 4);
        state.on_message(ChannelMessage::Binary(vec![2; 6])).unwrap();
        assert_eq!(state.received(), 10);

        match state.on_message(marker(10)).unwrap() {
            ReceiveStep::Complete(file) => {
                assert_eq!(file.data[..4], [1; 4]);
                assert_eq!(file.data[4..], [2; 6]);
                assert_eq!(file.name(), "f.bin");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(state.is_complete());
    }

    #[tokio::test]
    async fn early_marker_never_delivers_a_file() {
        let mut state = ReceiverState::new(0.01);
        state.on_message(metadata(10)).unwrap();
        state.on_message(ChannelMessage::Binary(vec![0; 4])).unwrap();

        let err = state.on_message(marker(4)).unwrap_err();
        assert!(matches!(err, TransferError::Incomplete { fraction } if (fraction - 0.4).abs() < 1e-9));
        assert!(!state.is_complete());
    }

    #[tokio::test]
    async fn overrun_is_a_size_mismatch() {
        let mut state = ReceiverState::new(0.01);
        state.on_message(metadata(4)).unwrap();
        state.on_message(ChannelMessage::Binary(vec![0; 6])).unwrap();
        let err = state.on_message(marker(6)).unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                announced: 4,
                received: 6
            }
        ));
    }

    #[tokio::test]
    async fn zero_length_file_completes_on_marker() {
        let mut state = ReceiverState::new(0.01);
        state.on_message(metadata(0)).unwrap();
        match state.on_message(marker(0)).unwrap() {
            ReceiveStep::Complete(file) => assert!(file.is_empty()),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bare_marker_completes_empty_file() {
        let mut state = ReceiverState::new(0.01);
        assert!(matches!(
            state.on_message(marker(0)).unwrap(),
            ReceiveStep::Complete(_)
        ));
    }

    #[tokio::test]
    async fn garbage_before_metadata_is_a_protocol_error() {
        let mut state = ReceiverState::new(0.01);
        let err = state
            .on_message(ChannelMessage::Binary(vec![0xff, 0x00]))
            .unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        // Still waiting for metadata.
        assert!(matches!(
            state.on_message(metadata(1)).unwrap(),
            ReceiveStep::Metadata(_)
        ));
    }

    #[tokio::test]
    async fn progress_reported_in_one_percent_steps() {
        let mut state = ReceiverState::new(0.01);
        state.on_message(metadata(1000)).unwrap();

        let mut reports = Vec::new();
        for _ in 0..200 {
            if let ReceiveStep::Progress(p) = state.on_message(ChannelMessage::Binary(vec![0; 5])).unwrap() {
                reports.push(p.percent);
            }
        }
        assert_eq!(reports.len(), 100);
        assert!(reports.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(reports.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn receiver_closes_channel_after_success() {
        let (_link, local, mut remote) = channel_pair("file_transfer_f.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(ChunkedReceiver::new(local, TransferConfig::default()).receive(tx));

        remote.channel.send(metadata(3)).await.unwrap();
        remote.channel.send_binary(vec![7, 8, 9]).await.unwrap();
        remote.channel.send(marker(3)).await.unwrap();

        let file = task.await.unwrap().unwrap();
        assert_eq!(file.data, vec![7, 8, 9]);

        assert!(matches!(rx.recv().await, Some(TransferEvent::Metadata(_))));
        let mut last = None;
        while let Ok(TransferEvent::Progress(p)) = rx.try_recv() {
            last = Some(p.percent);
        }
        assert_eq!(last, Some(100.0));

        while let Some(ev) = remote.events.recv().await {
            if ev == ChannelEvent::Closed {
                return;
            }
        }
        panic!("sender side never saw the close");
    }

    #[tokio::test]
    async fn close_at_forty_percent_reports_fraction() {
        let (_link, local, remote) = channel_pair("file_transfer_g.bin");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(ChunkedReceiver::new(local, TransferConfig::default()).receive(tx));

        remote.channel.send(metadata(1000)).await.unwrap();
        for _ in 0..4 {
            remote.channel.send_binary(vec![0; 100]).await.unwrap();
        }
        remote.channel.close().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        let fraction = err.fraction().expect("incomplete error");
        assert!((fraction - 0.4).abs() < 1e-9);

        while let Ok(event) = rx.try_recv() {
            if let TransferEvent::Progress(p) = event {
                assert!(p.percent <= 40.0);
            }
        }
    }
}
