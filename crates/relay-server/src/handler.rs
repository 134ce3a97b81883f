//! Handler trait for relay requests.
//!
//! The connection layer parses frames and dispatches each
//! [`RelayRequest`](toasty_protocol::RelayRequest) variant to one method.
//! Room bookkeeping lives in the implementor.

use std::future::Future;
use std::pin::Pin;

use toasty_protocol::{DescriptionUpdate, IceUpdate, RoomRef};

use crate::connection::{ConnId, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receives the requests of every relay connection.
///
/// `sender` identifies the requesting connection and is the channel for
/// replies to it.
pub trait Handler: Send + Sync + 'static {
    fn on_create_room(&self, sender: Sender) -> HandlerFuture<'_>;

    fn on_update_offer(&self, sender: Sender, update: DescriptionUpdate) -> HandlerFuture<'_>;

    fn on_get_offer(&self, sender: Sender, room: RoomRef) -> HandlerFuture<'_>;

    fn on_create_answer(&self, sender: Sender, update: DescriptionUpdate) -> HandlerFuture<'_>;

    fn on_ice_update(&self, sender: Sender, update: IceUpdate) -> HandlerFuture<'_>;

    /// Called once after the connection's read pump has stopped.
    fn on_disconnected(&self, _conn: ConnId) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}
