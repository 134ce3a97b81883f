//! Sending side: metadata, flow-controlled chunks, completion marker.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use toasty_protocol::{CompletionMarker, ControlMessage};
use toasty_transport::{ChannelEvent, ChannelEvents, ChannelState, DataChannel, DataChannelHandle};

use crate::file::OutgoingFile;
use crate::progress::{ProgressEstimator, completion_fraction};
use crate::{TransferConfig, TransferError, TransferEvent};

/// How a send finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendOutcome {
    pub bytes_sent: u64,
    pub total: u64,
    /// 1.0 once the marker went out and the receiver closed the channel.
    pub fraction: f64,
    /// Times the sender stopped to wait for the buffer to drain.
    pub pauses: u32,
}

impl SendOutcome {
    pub fn is_complete(&self) -> bool {
        self.fraction >= 1.0
    }
}

/// Requests a graceful stop of a running [`ChunkedSender`].
#[derive(Debug, Clone)]
pub struct EndHandle {
    token: CancellationToken,
}

impl EndHandle {
    /// Stops reading; the channel is closed once its buffer has drained.
    pub fn end(&self) {
        self.token.cancel();
    }
}

/// Why the fill loop stopped waiting.
enum Wake {
    Drained,
    Closed,
    Ended,
}

/// Streams one file over one data channel.
pub struct ChunkedSender {
    channel: Arc<dyn DataChannel>,
    events: ChannelEvents,
    config: TransferConfig,
    end: CancellationToken,
}

impl ChunkedSender {
    pub fn new(handle: DataChannelHandle, config: TransferConfig) -> Self {
        Self {
            channel: handle.channel,
            events: handle.events,
            config,
            end: CancellationToken::new(),
        }
    }

    pub fn end_handle(&self) -> EndHandle {
        EndHandle {
            token: self.end.clone(),
        }
    }

    /// Sends `file` once the channel is open.
    ///
    /// Returns the outcome with the fraction actually delivered: below 1.0
    /// if the channel closed (or [`EndHandle::end`] was called) first. Only
    /// read failures are errors.
    pub async fn send(
        mut self,
        mut file: OutgoingFile,
        progress: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<SendOutcome, TransferError> {
        let total = file.metadata().size;
        let mut outcome = SendOutcome {
            bytes_sent: 0,
            total,
            fraction: 0.0,
            pauses: 0,
        };

        self.channel
            .set_buffered_amount_low_threshold(self.config.buffered_low_threshold);

        if !self.wait_open().await {
            debug!(label = self.channel.label(), "channel closed before it opened");
            return Ok(outcome);
        }

        let metadata = ControlMessage::Metadata(file.metadata().clone()).encode()?;
        if self.channel.send_text(metadata).await.is_err() {
            return Ok(outcome);
        }
        info!(name = %file.metadata().name, size = total, "sending file");

        let estimator = ProgressEstimator::new(total);
        let mut slice = vec![0u8; self.config.read_slice_size];

        loop {
            if self.end.is_cancelled() {
                self.drain_and_close().await;
                outcome.fraction = completion_fraction(outcome.bytes_sent, total);
                info!(sent = outcome.bytes_sent, "send ended early on request");
                return Ok(outcome);
            }

            // Fill step: never read while the channel holds more than the ceiling.
            if self.channel.buffered_amount() > self.config.max_buffered_amount {
                outcome.pauses += 1;
                trace!(
                    buffered = self.channel.buffered_amount(),
                    "buffer full, waiting for drain"
                );
                match self.wait_drained().await {
                    Wake::Drained | Wake::Ended => continue,
                    Wake::Closed => break,
                }
            }

            let n = file.reader.read(&mut slice).await?;
            if n == 0 {
                if self.channel.ready_state() != ChannelState::Open {
                    break;
                }
                if outcome.bytes_sent != total {
                    warn!(
                        announced = total,
                        sent = outcome.bytes_sent,
                        "source length differs from announced size"
                    );
                }
                let marker = ControlMessage::Done(CompletionMarker::new(outcome.bytes_sent));
                if self.channel.send_text(marker.encode()?).await.is_err() {
                    break;
                }
                debug!(sent = outcome.bytes_sent, "completion marker sent");
                self.wait_closed().await;
                outcome.fraction = 1.0;
                info!(sent = outcome.bytes_sent, pauses = outcome.pauses, "file sent");
                return Ok(outcome);
            }

            let mut failed = false;
            for chunk in slice[..n].chunks(self.config.chunk_size) {
                if self.channel.send_binary(chunk.to_vec()).await.is_err() {
                    failed = true;
                    break;
                }
                outcome.bytes_sent += chunk.len() as u64;
            }
            let _ = progress.send(TransferEvent::Progress(
                estimator.estimate(outcome.bytes_sent),
            ));
            if failed {
                break;
            }
        }

        outcome.fraction = completion_fraction(outcome.bytes_sent, total);
        if total == 0 {
            outcome.fraction = 0.0;
        }
        info!(
            sent = outcome.bytes_sent,
            total,
            "channel closed before the transfer completed"
        );
        Ok(outcome)
    }

    /// Waits for the channel to open. `false` if it closed instead.
    async fn wait_open(&mut self) -> bool {
        loop {
            match self.channel.ready_state() {
                ChannelState::Open => return true,
                ChannelState::Closing | ChannelState::Closed => return false,
                ChannelState::Connecting => {}
            }
            tokio::select! {
                ev = self.events.recv() => match ev {
                    Some(ChannelEvent::Closed) | None => return false,
                    Some(_) => {}
                },
                _ = self.end.cancelled() => {
                    let _ = self.channel.close().await;
                    return false;
                }
            }
        }
    }

    async fn wait_drained(&mut self) -> Wake {
        loop {
            tokio::select! {
                ev = self.events.recv() => match ev {
                    Some(ChannelEvent::BufferedAmountLow) => return Wake::Drained,
                    Some(ChannelEvent::Closed) | None => return Wake::Closed,
                    Some(_) => {}
                },
                _ = self.end.cancelled() => return Wake::Ended,
            }
        }
    }

    async fn wait_closed(&mut self) {
        while let Some(ev) = self.events.recv().await {
            if ev == ChannelEvent::Closed {
                return;
            }
        }
    }

    /// Lets queued chunks reach the wire, then closes the channel.
    async fn drain_and_close(&mut self) {
        self.channel.set_buffered_amount_low_threshold(0);
        while self.channel.buffered_amount() > 0 {
            match self.events.recv().await {
                Some(ChannelEvent::Closed) | None => return,
                Some(_) => {}
            }
        }
        let _ = self.channel.close().await;
    }
}
