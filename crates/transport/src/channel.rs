//! Data channel capability.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::TransportFuture;

/// Lifecycle of a data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One message on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    /// Payload size in bytes, as counted by the buffered amount.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ChannelMessage::Text(text) => text.as_bytes(),
            ChannelMessage::Binary(data) => data,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ChannelMessage::Text(text) => text.into_bytes(),
            ChannelMessage::Binary(data) => data,
        }
    }
}

/// Notifications from a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    /// The buffered amount dropped from above the low threshold to at or below it.
    BufferedAmountLow,
    Closed,
}

/// Queue on which a data channel delivers its notifications.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// A reliable, ordered message channel to the remote peer.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    /// Queues a message. Fails unless the channel is open.
    fn send(&self, message: ChannelMessage) -> TransportFuture<'_, ()>;

    fn send_text(&self, text: String) -> TransportFuture<'_, ()> {
        self.send(ChannelMessage::Text(text))
    }

    fn send_binary(&self, data: Vec<u8>) -> TransportFuture<'_, ()> {
        self.send(ChannelMessage::Binary(data))
    }

    /// Bytes queued but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    fn buffered_amount_low_threshold(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Closes the channel once queued messages have been flushed.
    fn close(&self) -> TransportFuture<'_, ()>;
}

/// A data channel together with its event queue.
pub struct DataChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: ChannelEvents,
}

impl fmt::Debug for DataChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelHandle")
            .field("label", &self.channel.label())
            .field("state", &self.channel.ready_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_length_counts_payload_bytes() {
        assert_eq!(ChannelMessage::Text("héllo".into()).len(), 6);
        assert_eq!(ChannelMessage::Binary(vec![0; 16]).len(), 16);
        assert!(ChannelMessage::Binary(Vec::new()).is_empty());
    }

    #[test]
    fn into_bytes_keeps_text_utf8() {
        let bytes = ChannelMessage::Text("{}".into()).into_bytes();
        assert_eq!(bytes, b"{}");
    }
}
