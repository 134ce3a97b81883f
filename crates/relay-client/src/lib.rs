//! Client side of the Toasty signaling relay.
//!
//! Holds one persistent WebSocket to the relay, serialises
//! [`RelayRequest`](toasty_protocol::RelayRequest)s onto it and delivers
//! every decoded [`RelayMessage`](toasty_protocol::RelayMessage) as a
//! [`RelayEvent`] on an unbounded queue.

pub mod client;
pub(crate) mod pumps;

pub use client::{RelayClient, RelayError, RelayEvent, RelayEvents};
