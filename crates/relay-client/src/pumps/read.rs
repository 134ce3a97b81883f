//! Relay read pump: decodes incoming relay messages.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use toasty_protocol::RelayMessage;
use toasty_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};

use crate::client::RelayEvent;
use crate::pumps::write::Outbound;

/// Reads relay frames and delivers decoded messages as events.
///
/// Any incoming frame resets the pong deadline. If nothing arrives within
/// [`WS_PONG_WAIT`] the connection is considered dead. On exit the pump
/// emits [`RelayEvent::Closed`] and cancels the sibling pumps.
pub(crate) async fn read_pump<S>(
    mut read: S,
    events: mpsc::UnboundedSender<RelayEvent>,
    write_tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("relay silent past pong deadline, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                if let Some(message) = decode_text(&text) {
                                    let _ = events.send(RelayEvent::Message(message));
                                }
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(Outbound::Pong(data.to_vec())).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("relay sent close frame");
                                break;
                            }
                            _ => {} // the relay never sends binary
                        }
                    }
                    Some(Err(e)) => {
                        warn!("relay read error: {e}");
                        break;
                    }
                    None => {
                        debug!("relay stream ended");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = events.send(RelayEvent::Closed);
}

/// Decodes one text frame. Malformed and unknown messages yield `None`.
fn decode_text(text: &str) -> Option<RelayMessage> {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("relay message too large ({} bytes), dropping", text.len());
        return None;
    }

    match RelayMessage::from_json(text) {
        Ok(RelayMessage::Unknown) => {
            debug!("ignoring unknown relay message");
            None
        }
        Ok(message) => {
            trace!(?message, "relay message");
            Some(message)
        }
        Err(e) => {
            warn!("failed to parse relay message: {e}");
            None
        }
    }
}
