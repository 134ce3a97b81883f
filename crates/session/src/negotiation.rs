//! Bootstraps a peer connection through the relay.
//!
//! Sender: `idle -> awaiting_room -> awaiting_answer -> negotiated`.
//! The data channel created by the session raises negotiation-needed,
//! which asks the relay for a room; the offer is published once the room
//! id arrives and the answer closes the exchange.
//!
//! Receiver: `idle -> awaiting_offer -> negotiated`. The room id is known
//! up front; the offer is fetched, answered, and the answer published.
//!
//! In both roles ICE runs alongside. Local candidates are published as
//! soon as a room id is known (held until then). Remote candidates that
//! arrive before the remote description are held and applied in arrival
//! order right after it is set; a candidate that fails to apply is logged
//! and skipped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use toasty_protocol::{IceCandidate, PeerRole, RelayMessage, RoomId, SessionDescription};
use toasty_relay_client::{RelayClient, RelayEvent, RelayEvents};
use toasty_transport::{DataChannelHandle, PeerConnection, PeerEvent, PeerEvents, PeerState};

use crate::NegotiationError;

/// Which end of the transfer this peer is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationRole {
    Sender,
    /// Joins an existing room, obtained out of band.
    Receiver(RoomId),
}

impl NegotiationRole {
    fn peer_role(&self) -> PeerRole {
        match self {
            NegotiationRole::Sender => PeerRole::Sender,
            NegotiationRole::Receiver(_) => PeerRole::Receiver,
        }
    }
}

/// Progress reported to the session.
#[derive(Debug)]
pub enum NegotiationEvent {
    /// The relay assigned a room; share it with the receiver.
    RoomAssigned(RoomId),
    /// The remote peer opened a data channel.
    DataChannel(DataChannelHandle),
    PeerState(PeerState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    AwaitingRoom,
    AwaitingAnswer,
    AwaitingOffer,
    Negotiated,
}

/// Drives one peer connection through signaling.
pub struct NegotiationCoordinator {
    role: NegotiationRole,
    relay: RelayClient,
    relay_events: Option<RelayEvents>,
    peer: Arc<dyn PeerConnection>,
    peer_events: PeerEvents,
    events: mpsc::UnboundedSender<NegotiationEvent>,
    stage: Stage,
    room: Option<RoomId>,
    peer_connected: bool,
    pending_local: Vec<IceCandidate>,
    pending_remote: Vec<IceCandidate>,
}

impl NegotiationCoordinator {
    /// Connects to the relay. Signaling starts with [`run`](Self::run).
    pub async fn connect(
        relay_url: &str,
        role: NegotiationRole,
        peer: Arc<dyn PeerConnection>,
        peer_events: PeerEvents,
        events: mpsc::UnboundedSender<NegotiationEvent>,
    ) -> Result<Self, NegotiationError> {
        let (relay, relay_events) = RelayClient::connect(relay_url).await?;
        let room = match &role {
            NegotiationRole::Sender => None,
            NegotiationRole::Receiver(room) => Some(room.clone()),
        };
        Ok(Self {
            role,
            relay,
            relay_events: Some(relay_events),
            peer,
            peer_events,
            events,
            stage: Stage::Idle,
            room,
            peer_connected: false,
            pending_local: Vec::new(),
            pending_remote: Vec::new(),
        })
    }

    /// Runs signaling until cancelled or the peer connection goes away.
    ///
    /// Returns an error for terminal negotiation failures. Once the peers
    /// are connected, losing the relay is no longer an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), NegotiationError> {
        if let NegotiationRole::Receiver(room) = &self.role {
            info!(room = %room, "requesting offer");
            self.relay.get_offer(room.clone()).await?;
            self.stage = Stage::AwaitingOffer;
        }

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                ev = self.peer_events.recv() => match ev {
                    Some(ev) => {
                        if let Err(e) = self.on_peer_event(ev).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },

                ev = next_relay_event(&mut self.relay_events) => {
                    if let Err(e) = self.on_relay_event(ev).await {
                        break Err(e);
                    }
                }
            }
        };

        self.relay.close().await;
        result
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), NegotiationError> {
        match event {
            PeerEvent::NegotiationNeeded => {
                if self.role == NegotiationRole::Sender && self.stage == Stage::Idle {
                    debug!("negotiation needed, requesting room");
                    self.relay.create_room().await?;
                    self.stage = Stage::AwaitingRoom;
                }
            }
            PeerEvent::IceCandidate(Some(candidate)) if !candidate.is_end_of_candidates() => {
                self.publish_candidate(candidate).await;
            }
            PeerEvent::IceCandidate(_) => trace!("local candidate gathering finished"),
            PeerEvent::DataChannel(handle) => {
                debug!(label = handle.channel.label(), "remote data channel");
                let _ = self.events.send(NegotiationEvent::DataChannel(handle));
            }
            PeerEvent::StateChanged(state) => {
                debug!(?state, "peer connection state");
                if state == PeerState::Connected {
                    self.peer_connected = true;
                }
                let _ = self.events.send(NegotiationEvent::PeerState(state));
            }
        }
        Ok(())
    }

    async fn on_relay_event(&mut self, event: RelayEvent) -> Result<(), NegotiationError> {
        let message = match event {
            RelayEvent::Message(message) => message,
            RelayEvent::Closed => {
                self.relay_events = None;
                if self.peer_connected {
                    info!("relay connection closed after the peers connected");
                    return Ok(());
                }
                return Err(NegotiationError::RelayClosed);
            }
        };

        match message {
            RelayMessage::CreateRoom { id } if self.stage == Stage::AwaitingRoom => {
                self.on_room_assigned(id).await
            }
            RelayMessage::UpdateOffer { id } => {
                debug!(room = %id, "relay stored the offer");
                Ok(())
            }
            RelayMessage::GetOffer { .. } if self.stage == Stage::AwaitingOffer => {
                match message.description() {
                    Some(offer) => self.on_offer(offer).await,
                    None => Ok(()),
                }
            }
            RelayMessage::RecvAnswer { .. } if self.stage == Stage::AwaitingAnswer => {
                match message.description() {
                    Some(answer) => self.on_answer(answer).await,
                    None => Ok(()),
                }
            }
            RelayMessage::IceCandidate { ice_candidate, .. } => {
                self.on_remote_candidate(ice_candidate).await;
                Ok(())
            }
            RelayMessage::Error { id, message } => {
                if self.peer_connected {
                    warn!(room = ?id, "relay error after connect: {message}");
                    Ok(())
                } else {
                    Err(NegotiationError::Rejected(message))
                }
            }
            other => {
                debug!(stage = ?self.stage, ?other, "ignoring relay message");
                Ok(())
            }
        }
    }

    /// Sender: publish the offer for the new room, then apply it locally.
    async fn on_room_assigned(&mut self, room: RoomId) -> Result<(), NegotiationError> {
        info!(room = %room, "room assigned");
        self.room = Some(room.clone());
        let offer = self.peer.create_offer().await?;
        self.relay.update_offer(room.clone(), offer.clone()).await?;
        let _ = self.events.send(NegotiationEvent::RoomAssigned(room));
        self.peer.set_local_description(offer).await?;
        self.stage = Stage::AwaitingAnswer;

        for candidate in std::mem::take(&mut self.pending_local) {
            self.publish_candidate(candidate).await;
        }
        Ok(())
    }

    /// Receiver: apply the offer and publish the answer.
    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        debug!("offer received");
        self.peer.set_remote_description(offer).await?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        if let Some(room) = self.room.clone() {
            self.relay.create_answer(room, answer).await?;
        }
        self.stage = Stage::Negotiated;
        self.apply_pending_remote().await;
        Ok(())
    }

    /// Sender: apply the answer.
    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        debug!("answer received");
        self.peer.set_remote_description(answer).await?;
        self.stage = Stage::Negotiated;
        self.apply_pending_remote().await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if candidate.is_end_of_candidates() {
            return;
        }
        if !self.peer.has_remote_description() {
            trace!("holding remote candidate until the remote description is set");
            self.pending_remote.push(candidate);
            return;
        }
        self.apply_remote(candidate).await;
    }

    async fn apply_pending_remote(&mut self) {
        let pending = std::mem::take(&mut self.pending_remote);
        if !pending.is_empty() {
            debug!(count = pending.len(), "applying held remote candidates");
        }
        for candidate in pending {
            self.apply_remote(candidate).await;
        }
    }

    async fn apply_remote(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            warn!("failed to apply remote candidate: {e}");
        }
    }

    async fn publish_candidate(&mut self, candidate: IceCandidate) {
        let Some(room) = self.room.clone() else {
            self.pending_local.push(candidate);
            return;
        };
        if self.relay_events.is_none() {
            return;
        }
        if let Err(e) = self
            .relay
            .ice_update(room, self.role.peer_role(), candidate)
            .await
        {
            warn!("failed to publish local candidate: {e}");
        }
    }
}

/// Next relay event, or never once the relay is gone.
async fn next_relay_event(events: &mut Option<RelayEvents>) -> RelayEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(RelayEvent::Closed),
        None => std::future::pending().await,
    }
}
