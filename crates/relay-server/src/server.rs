//! Relay WebSocket server.
//!
//! Listens on a TCP port, upgrades every connection to WebSocket and hands
//! its requests to the shared [`Rooms`] registry. A background sweeper
//! drops rooms that outlive their TTL.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use toasty_protocol::constants::{DEFAULT_RELAY_PORT, WS_MAX_MESSAGE_SIZE};

use crate::ServerError;
use crate::connection::{self, ConnId};
use crate::registry::{RoomRegistry, Rooms};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Rooms older than this are dropped by the sweeper.
    pub room_ttl: Duration,
    pub sweep_interval: Duration,
    /// `create_room` answers with an error once this many rooms exist.
    pub max_rooms: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_RELAY_PORT,
            room_ttl: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(30),
            max_rooms: 10_000,
        }
    }
}

/// The signaling relay.
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<Rooms>,
    next_conn: AtomicU64,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let registry = RoomRegistry::new(config.max_rooms, config.room_ttl);
        Arc::new(Self {
            config,
            rooms: Arc::new(Rooms::new(registry)),
            next_conn: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of rooms currently registered.
    pub fn room_count(&self) -> usize {
        self.rooms.room_count()
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind, self.config.port);
        let listener = {
            let mut bound = self.local_addr.lock().await;
            if bound.is_some() {
                return Err(ServerError::AlreadyRunning);
            }
            let listener = TcpListener::bind(addr).await?;
            *bound = Some(listener.local_addr()?);
            listener
        };
        tracing::info!("relay listening on {}", listener.local_addr()?);

        tokio::spawn(sweep_rooms(
            Arc::clone(&self.rooms),
            self.config.sweep_interval,
            self.cancel.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("relay shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and starts its pumps.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let id = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        tracing::info!(conn = %id, %peer_addr, "relay connection established");

        connection::spawn_connection(
            ws_stream,
            id,
            peer_addr,
            Arc::clone(&self.rooms),
            self.cancel.clone(),
        );
        Ok(())
    }
}

/// Periodically drops expired rooms.
async fn sweep_rooms(rooms: Arc<Rooms>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let removed = rooms.sweep_expired();
                if removed > 0 {
                    tracing::info!(removed, "expired rooms swept");
                }
            }
        }
    }
}
