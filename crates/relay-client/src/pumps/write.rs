//! Relay write pump: encodes queued requests and keeps the socket alive.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

use toasty_protocol::RelayRequest;
use toasty_protocol::constants::WS_PING_PERIOD;

/// Work queued for the write pump.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outbound {
    Request(RelayRequest),
    /// Answer to a relay ping, echoing its payload.
    Pong(Vec<u8>),
}

/// Writes queued requests as JSON text frames and pings the relay every
/// [`WS_PING_PERIOD`]. Sends a close frame on the way out.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,

            item = outbound.recv() => match item {
                Some(Outbound::Request(request)) => match request.to_json() {
                    Ok(json) => {
                        trace!(?request, "relay request");
                        tungstenite::Message::Text(json.into())
                    }
                    Err(e) => {
                        warn!("failed to encode relay request: {e}");
                        continue;
                    }
                },
                Some(Outbound::Pong(data)) => tungstenite::Message::Pong(data.into()),
                None => break,
            },

            _ = ping_interval.tick() => tungstenite::Message::Ping(Vec::new().into()),
        };

        if let Err(e) = write.send(frame).await {
            error!("relay write error: {e}");
            break;
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;
    use toasty_protocol::RoomId;

    fn capture_sink(
        tx: mpsc::UnboundedSender<tungstenite::Message>,
    ) -> impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg);
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    #[tokio::test]
    async fn requests_are_encoded_in_order_then_closed() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let handle = tokio::spawn(write_pump(
            capture_sink(sink_tx),
            outbound_rx,
            CancellationToken::new(),
        ));

        outbound_tx
            .send(Outbound::Request(RelayRequest::create_room()))
            .await
            .unwrap();
        outbound_tx
            .send(Outbound::Request(RelayRequest::get_offer(RoomId::from("ab12cd34"))))
            .await
            .unwrap();
        drop(outbound_tx);
        handle.await.unwrap();

        assert_eq!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Text(r#"{"create_room":true}"#.into()))
        );
        assert_eq!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Text(
                r#"{"get_offer":{"id":"ab12cd34"}}"#.into()
            ))
        );
        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Close(_))
        ));
    }

    #[tokio::test]
    async fn pong_echoes_payload() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let handle = tokio::spawn(write_pump(
            capture_sink(sink_tx),
            outbound_rx,
            CancellationToken::new(),
        ));

        outbound_tx.send(Outbound::Pong(vec![7, 8])).await.unwrap();
        drop(outbound_tx);
        handle.await.unwrap();

        assert_eq!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Pong(vec![7, 8].into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_pinged_each_period() {
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let (_outbound_tx, outbound_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(write_pump(capture_sink(sink_tx), outbound_rx, cancel.clone()));

        tokio::time::sleep(WS_PING_PERIOD * 2 + std::time::Duration::from_millis(10)).await;
        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Ping(_))));
        assert!(matches!(sink_rx.recv().await, Some(tungstenite::Message::Ping(_))));
        assert!(sink_rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Close(_))
        ));
    }
}
