//! Relay connection management: read/write pumps, ping/pong, send buffering.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use toasty_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use toasty_protocol::{RelayMessage, RelayRequest};

use crate::SEND_BUFFER_SIZE;
use crate::handler::Handler;

/// Identifies one accepted connection for the lifetime of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle for sending messages to one connected peer.
///
/// Cloneable and cheap: wraps an `mpsc::Sender`.
#[derive(Clone)]
pub struct Sender {
    id: ConnId,
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    pub(crate) fn new(id: ConnId, tx: mpsc::Sender<WsMessage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Sends a relay message as JSON text.
    ///
    /// Returns `Err` only if the queue is full or the peer disconnected.
    pub fn send_msg(&self, msg: &RelayMessage) -> Result<(), SendError> {
        let json = msg.to_json().map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!(conn = %self.id, "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Returns `true` if the send queue is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl fmt::Debug for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").field("id", &self.id).finish()
    }
}

/// Error returned when the send queue is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// An accepted relay connection.
///
/// Owns the pump tasks through its cancel token.
pub struct RelayConnection {
    pub remote_addr: SocketAddr,
    sender: Sender,
    cancel: CancellationToken,
}

impl RelayConnection {
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn id(&self) -> ConnId {
        self.sender.id
    }

    /// Signals the pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// The pumps run as background tasks and stop when the peer goes away or
/// the server's cancel token fires. The handler's `on_disconnected` runs
/// once the read pump has exited.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    id: ConnId,
    remote_addr: SocketAddr,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> RelayConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender::new(id, tx);

    let conn = RelayConnection {
        remote_addr,
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel;
    tokio::spawn(async move {
        read_pump(ws_stream, sender, handler.clone(), read_cancel.clone()).await;
        read_cancel.cancel();
        handler.on_disconnected(id).await;
        tracing::info!(conn = %id, %remote_addr, "relay connection closed");
    });

    conn
}

/// Write pump: drains the send queue and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches requests to the handler.
///
/// Any frame from the peer counts as a sign of life; if nothing arrives
/// within [`WS_PONG_WAIT`] the connection is dropped.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                tracing::warn!(conn = %sender.id, "pong timeout, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match ws_msg {
                            WsMessage::Text(text) => {
                                if text.len() > WS_MAX_MESSAGE_SIZE {
                                    tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                    continue;
                                }
                                dispatch_text(&handler, &sender, &text).await;
                            }
                            WsMessage::Binary(data) => {
                                tracing::warn!(conn = %sender.id, len = data.len(), "ignoring binary frame");
                            }
                            WsMessage::Ping(data) => {
                                let _ = sender.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => {}
                            WsMessage::Close(_) => {
                                tracing::debug!(conn = %sender.id, "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Parses a text frame and dispatches it to the matching handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let request = match RelayRequest::from_json(text) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(conn = %sender.id, "invalid relay request: {e}");
            return;
        }
    };

    tracing::trace!(conn = %sender.id, ?request, "relay request");
    let s = sender.clone();
    match request {
        RelayRequest::CreateRoom(_) => handler.on_create_room(s).await,
        RelayRequest::UpdateOffer(update) => handler.on_update_offer(s, update).await,
        RelayRequest::GetOffer(room) => handler.on_get_offer(s, room).await,
        RelayRequest::CreateAnswer(update) => handler.on_create_answer(s, update).await,
        RelayRequest::IceUpdate(update) => handler.on_ice_update(s, update).await,
    }
}

#[cfg(test)]
pub(crate) fn test_sender(id: u64) -> (Sender, mpsc::Receiver<WsMessage>) {
    let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
    (Sender::new(ConnId(id), tx), rx)
}
