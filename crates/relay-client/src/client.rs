//! WebSocket client for the signaling relay.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use toasty_protocol::constants::WS_MAX_MESSAGE_SIZE;
use toasty_protocol::{
    IceCandidate, PeerRole, RelayMessage, RelayRequest, RoomId, SessionDescription,
};

use crate::pumps::write::Outbound;

/// Errors from the relay client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("relay connection closed")]
    Closed,
}

/// Something that happened on the relay connection.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Message(RelayMessage),
    /// The connection is gone; no further events follow.
    Closed,
}

/// Queue on which the client delivers relay events.
pub type RelayEvents = mpsc::UnboundedReceiver<RelayEvent>;

/// A persistent connection to the signaling relay.
pub struct RelayClient {
    write_tx: mpsc::Sender<Outbound>,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl RelayClient {
    /// Opens the WebSocket and starts the read and write pumps.
    pub async fn connect(url: &str) -> Result<(Self, RelayEvents), RelayError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        debug!(url, "connected to relay");
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<Outbound>(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read, event_tx, write_tx, cancel,
            ))
        };

        let client = Self {
            write_tx,
            _read_handle: read_handle,
            _write_handle: write_handle,
            cancel,
        };
        Ok((client, event_rx))
    }

    /// Queues a request; the write pump encodes it.
    pub async fn send(&self, request: RelayRequest) -> Result<(), RelayError> {
        self.write_tx
            .send(Outbound::Request(request))
            .await
            .map_err(|_| RelayError::Closed)
    }

    pub async fn create_room(&self) -> Result<(), RelayError> {
        self.send(RelayRequest::create_room()).await
    }

    pub async fn update_offer(
        &self,
        room: RoomId,
        offer: SessionDescription,
    ) -> Result<(), RelayError> {
        self.send(RelayRequest::update_offer(room, offer)).await
    }

    pub async fn get_offer(&self, room: RoomId) -> Result<(), RelayError> {
        self.send(RelayRequest::get_offer(room)).await
    }

    pub async fn create_answer(
        &self,
        room: RoomId,
        answer: SessionDescription,
    ) -> Result<(), RelayError> {
        self.send(RelayRequest::create_answer(room, answer)).await
    }

    pub async fn ice_update(
        &self,
        room: RoomId,
        role: PeerRole,
        candidate: IceCandidate,
    ) -> Result<(), RelayError> {
        self.send(RelayRequest::ice_update(room, role, candidate))
            .await
    }

    /// Returns `true` once the connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.write_tx.is_closed()
    }

    /// Closes the connection; the write pump sends the close frame.
    pub async fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_client() -> (RelayClient, mpsc::Receiver<Outbound>) {
        let (write_tx, write_rx) = mpsc::channel(16);
        let client = RelayClient {
            write_tx,
            _read_handle: tokio::spawn(async {}),
            _write_handle: tokio::spawn(async {}),
            cancel: CancellationToken::new(),
        };
        (client, write_rx)
    }

    #[test]
    fn relay_error_display() {
        assert_eq!(RelayError::Closed.to_string(), "relay connection closed");
    }

    #[tokio::test]
    async fn create_room_writes_wire_request() {
        let (client, mut write_rx) = detached_client();
        client.create_room().await.unwrap();

        assert_eq!(
            write_rx.recv().await,
            Some(Outbound::Request(RelayRequest::create_room()))
        );
    }

    #[tokio::test]
    async fn ice_update_names_role_and_room() {
        let (client, mut write_rx) = detached_client();
        client
            .ice_update(
                RoomId::from("ab12cd34"),
                PeerRole::Receiver,
                IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host"),
            )
            .await
            .unwrap();

        let Some(Outbound::Request(request)) = write_rx.recv().await else {
            panic!("expected a queued request");
        };
        let value: serde_json::Value = serde_json::from_str(&request.to_json().unwrap()).unwrap();
        assert_eq!(value["ice_update"]["id"], "ab12cd34");
        assert_eq!(value["ice_update"]["peer"], "receiver");
        assert!(value["ice_update"]["ice_candidate"]["candidate"].is_string());
    }

    #[tokio::test]
    async fn send_after_writer_gone_reports_closed() {
        let (client, write_rx) = detached_client();
        drop(write_rx);
        assert!(client.is_closed());
        let err = client.get_offer(RoomId::from("x")).await.unwrap_err();
        assert!(matches!(err, RelayError::Closed));
    }
}
