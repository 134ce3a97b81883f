//! Room bookkeeping.
//!
//! [`RoomRegistry`] is the synchronous state machine: every request yields
//! the list of messages to deliver and to whom. [`Rooms`] wraps it behind a
//! lock and implements [`Handler`] so the connection layer can drive it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use toasty_protocol::constants::ROOM_ID_LEN;
use toasty_protocol::{
    DescriptionUpdate, IceCandidate, IceUpdate, PeerRole, RelayMessage, RoomId, RoomRef,
    SessionDescription,
};

use crate::connection::{ConnId, Sender};
use crate::handler::{Handler, HandlerFuture};

/// A message to deliver to one connection.
pub type Delivery = (Sender, RelayMessage);

struct Room {
    created: Instant,
    offer: Option<SessionDescription>,
    sender: Option<Sender>,
    receiver: Option<Sender>,
    /// Replayed to the receiver when it joins. Receiver candidates are
    /// only forwarded: the sender is bound before any receiver can exist.
    sender_ice: Vec<IceCandidate>,
}

impl Room {
    fn new(created: Instant, sender: Sender) -> Self {
        Self {
            created,
            offer: None,
            sender: Some(sender),
            receiver: None,
            sender_ice: Vec::new(),
        }
    }

    fn connection(&self, role: PeerRole) -> Option<&Sender> {
        match role {
            PeerRole::Sender => self.sender.as_ref(),
            PeerRole::Receiver => self.receiver.as_ref(),
        }
    }
}

/// Rooms keyed by id, each pairing one sender and one receiver connection.
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    max_rooms: usize,
    room_ttl: Duration,
}

impl RoomRegistry {
    pub fn new(max_rooms: usize, room_ttl: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            max_rooms,
            room_ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    #[cfg(test)]
    fn stored_candidates(&self, id: &RoomId) -> usize {
        self.rooms.get(id).map_or(0, |room| room.sender_ice.len())
    }

    /// Allocates a fresh room with `from` as its sender.
    pub fn create_room(&mut self, from: &Sender, now: Instant) -> Vec<Delivery> {
        if self.rooms.len() >= self.max_rooms {
            warn!(conn = %from.id(), max = self.max_rooms, "room limit reached");
            return vec![(from.clone(), RelayMessage::error(None, "relay is full"))];
        }

        let id = loop {
            let candidate = RoomId::new(&uuid::Uuid::new_v4().simple().to_string()[..ROOM_ID_LEN]);
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        self.rooms.insert(id.clone(), Room::new(now, from.clone()));
        info!(room = %id, conn = %from.id(), "room created");
        vec![(from.clone(), RelayMessage::CreateRoom { id })]
    }

    /// Stores the offer for a room, creating the room if needed.
    pub fn update_offer(
        &mut self,
        from: &Sender,
        update: DescriptionUpdate,
        now: Instant,
    ) -> Vec<Delivery> {
        let DescriptionUpdate { id, description } = update;
        let full = self.rooms.len() >= self.max_rooms;
        let room = match self.rooms.entry(id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(_) if full => {
                return vec![(from.clone(), RelayMessage::error(Some(id), "relay is full"))];
            }
            Entry::Vacant(entry) => {
                debug!(room = %id, "offer for unknown room, creating it");
                entry.insert(Room::new(now, from.clone()))
            }
        };
        room.offer = Some(description);
        room.sender = Some(from.clone());
        debug!(room = %id, conn = %from.id(), "offer stored");
        vec![(from.clone(), RelayMessage::UpdateOffer { id })]
    }

    /// Binds `from` as the receiver and hands it the offer followed by the
    /// sender candidates gathered so far.
    pub fn get_offer(&mut self, from: &Sender, room_ref: RoomRef) -> Vec<Delivery> {
        let id = room_ref.id;
        let Some(room) = self.rooms.get_mut(&id) else {
            debug!(room = %id, "get_offer for unknown room");
            return vec![(from.clone(), RelayMessage::error(Some(id), "unknown room"))];
        };
        let Some(offer) = room.offer.clone() else {
            return vec![(
                from.clone(),
                RelayMessage::error(Some(id), "room has no offer yet"),
            )];
        };

        room.receiver = Some(from.clone());
        info!(room = %id, conn = %from.id(), "receiver joined");

        let mut out = Vec::with_capacity(1 + room.sender_ice.len());
        out.push((from.clone(), RelayMessage::offer(id.clone(), offer)));
        for candidate in &room.sender_ice {
            out.push((
                from.clone(),
                RelayMessage::IceCandidate {
                    id: id.clone(),
                    ice_candidate: candidate.clone(),
                },
            ));
        }
        out
    }

    /// Forwards the receiver's answer to the room's sender.
    pub fn create_answer(&mut self, from: &Sender, update: DescriptionUpdate) -> Vec<Delivery> {
        let DescriptionUpdate { id, description } = update;
        let Some(room) = self.rooms.get_mut(&id) else {
            return vec![(from.clone(), RelayMessage::error(Some(id), "unknown room"))];
        };
        if room.receiver.is_none() {
            room.receiver = Some(from.clone());
        }
        match room.sender.clone() {
            Some(sender) => {
                debug!(room = %id, "forwarding answer to sender");
                vec![(sender, RelayMessage::answer(id, description))]
            }
            None => vec![(
                from.clone(),
                RelayMessage::error(Some(id), "sender is gone"),
            )],
        }
    }

    /// Forwards a candidate to the other role if that connection is bound.
    /// Sender candidates are also kept for a receiver that joins later.
    pub fn ice_update(&mut self, from: &Sender, update: IceUpdate) -> Vec<Delivery> {
        let IceUpdate {
            id,
            peer,
            ice_candidate,
        } = update;
        let Some(room) = self.rooms.get_mut(&id) else {
            warn!(room = %id, conn = %from.id(), "candidate for unknown room dropped");
            return Vec::new();
        };

        if peer == PeerRole::Sender {
            room.sender_ice.push(ice_candidate.clone());
        }

        match room.connection(peer.opposite()) {
            Some(to) => vec![(
                to.clone(),
                RelayMessage::IceCandidate { id, ice_candidate },
            )],
            None => Vec::new(),
        }
    }

    /// Forgets a closed connection. Rooms it was sending in are removed.
    ///
    /// Returns the number of rooms removed.
    pub fn disconnect(&mut self, conn: ConnId) -> usize {
        let before = self.rooms.len();
        self.rooms
            .retain(|_, room| room.sender.as_ref().is_none_or(|s| s.id() != conn));
        for room in self.rooms.values_mut() {
            if room.receiver.as_ref().is_some_and(|r| r.id() == conn) {
                room.receiver = None;
            }
        }
        before - self.rooms.len()
    }

    /// Removes rooms older than the configured TTL. Returns how many went.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.rooms.len();
        let ttl = self.room_ttl;
        self.rooms
            .retain(|_, room| now.saturating_duration_since(room.created) < ttl);
        before - self.rooms.len()
    }
}

/// Thread-safe room registry that handles relay requests.
pub struct Rooms {
    registry: Mutex<RoomRegistry>,
}

impl Rooms {
    pub fn new(registry: RoomRegistry) -> Self {
        Self {
            registry: Mutex::new(registry),
        }
    }

    pub fn room_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    pub fn sweep_expired(&self) -> usize {
        self.registry.lock().unwrap().sweep_expired(Instant::now())
    }

    fn apply(&self, f: impl FnOnce(&mut RoomRegistry) -> Vec<Delivery>) -> HandlerFuture<'_> {
        let deliveries = f(&mut self.registry.lock().unwrap());
        for (to, message) in deliveries {
            let _ = to.send_msg(&message);
        }
        Box::pin(async {})
    }
}

impl Handler for Rooms {
    fn on_create_room(&self, sender: Sender) -> HandlerFuture<'_> {
        self.apply(|r| r.create_room(&sender, Instant::now()))
    }

    fn on_update_offer(&self, sender: Sender, update: DescriptionUpdate) -> HandlerFuture<'_> {
        self.apply(|r| r.update_offer(&sender, update, Instant::now()))
    }

    fn on_get_offer(&self, sender: Sender, room: RoomRef) -> HandlerFuture<'_> {
        self.apply(|r| r.get_offer(&sender, room))
    }

    fn on_create_answer(&self, sender: Sender, update: DescriptionUpdate) -> HandlerFuture<'_> {
        self.apply(|r| r.create_answer(&sender, update))
    }

    fn on_ice_update(&self, sender: Sender, update: IceUpdate) -> HandlerFuture<'_> {
        self.apply(|r| r.ice_update(&sender, update))
    }

    fn on_disconnected(&self, conn: ConnId) -> HandlerFuture<'_> {
        let removed = self.registry.lock().unwrap().disconnect(conn);
        if removed > 0 {
            info!(%conn, removed, "sender gone, rooms removed");
        }
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_sender;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(100, Duration::from_secs(600))
    }

    fn room_of(deliveries: &[Delivery]) -> RoomId {
        match &deliveries[0].1 {
            RelayMessage::CreateRoom { id } => id.clone(),
            other => panic!("expected create_room, got {other:?}"),
        }
    }

    fn targets(deliveries: &[Delivery]) -> Vec<ConnId> {
        deliveries.iter().map(|(to, _)| to.id()).collect()
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    fn drain(rx: &mut mpsc::Receiver<WsMessage>) -> Vec<RelayMessage> {
        let mut out = Vec::new();
        while let Ok(WsMessage::Text(t)) = rx.try_recv() {
            out.push(RelayMessage::from_json(t.as_str()).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn create_room_assigns_short_hex_id() {
        let mut reg = registry();
        let (s, _rx) = test_sender(1);
        let out = reg.create_room(&s, Instant::now());
        let id = room_of(&out);
        assert_eq!(id.as_str().len(), ROOM_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(targets(&out), vec![ConnId(1)]);
        assert!(reg.contains(&id));
    }

    #[tokio::test]
    async fn create_room_refused_when_full() {
        let mut reg = RoomRegistry::new(1, Duration::from_secs(600));
        let (s, _rx) = test_sender(1);
        reg.create_room(&s, Instant::now());
        let out = reg.create_room(&s, Instant::now());
        assert!(matches!(out[0].1, RelayMessage::Error { id: None, .. }));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn update_offer_acks_and_creates_unknown_room() {
        let mut reg = registry();
        let (s, _rx) = test_sender(1);
        let out = reg.update_offer(
            &s,
            DescriptionUpdate {
                id: "ABC123".into(),
                description: SessionDescription::offer("v=0"),
            },
            Instant::now(),
        );
        assert_eq!(
            out[0].1,
            RelayMessage::UpdateOffer {
                id: "ABC123".into()
            }
        );
        assert!(reg.contains(&"ABC123".into()));
    }

    #[tokio::test]
    async fn get_offer_replays_sender_candidates_in_order() {
        let mut reg = registry();
        let (s, _srx) = test_sender(1);
        let (r, _rrx) = test_sender(2);
        let id = room_of(&reg.create_room(&s, Instant::now()));

        let before_offer = reg.ice_update(
            &s,
            IceUpdate {
                id: id.clone(),
                peer: PeerRole::Sender,
                ice_candidate: candidate(1),
            },
        );
        assert!(before_offer.is_empty(), "no receiver bound yet");
        reg.update_offer(
            &s,
            DescriptionUpdate {
                id: id.clone(),
                description: SessionDescription::offer("v=0 offer"),
            },
            Instant::now(),
        );
        reg.ice_update(
            &s,
            IceUpdate {
                id: id.clone(),
                peer: PeerRole::Sender,
                ice_candidate: candidate(2),
            },
        );

        let out = reg.get_offer(&r, RoomRef { id: id.clone() });
        assert_eq!(targets(&out), vec![ConnId(2); 3]);
        assert_eq!(
            out[0].1.description(),
            Some(SessionDescription::offer("v=0 offer"))
        );
        assert_eq!(
            out[1].1,
            RelayMessage::IceCandidate {
                id: id.clone(),
                ice_candidate: candidate(1)
            }
        );
        assert_eq!(
            out[2].1,
            RelayMessage::IceCandidate {
                id,
                ice_candidate: candidate(2)
            }
        );
    }

    #[tokio::test]
    async fn get_offer_for_unknown_room_is_an_error() {
        let mut reg = registry();
        let (r, _rx) = test_sender(2);
        let out = reg.get_offer(&r, RoomRef { id: "nope".into() });
        assert!(matches!(&out[0].1, RelayMessage::Error { id: Some(id), .. } if id.as_str() == "nope"));
    }

    #[tokio::test]
    async fn get_offer_before_offer_is_an_error() {
        let mut reg = registry();
        let (s, _srx) = test_sender(1);
        let (r, _rrx) = test_sender(2);
        let id = room_of(&reg.create_room(&s, Instant::now()));
        let out = reg.get_offer(&r, RoomRef { id });
        assert!(matches!(out[0].1, RelayMessage::Error { .. }));
    }

    #[tokio::test]
    async fn answer_goes_to_sender_only() {
        let mut reg = registry();
        let (s, _srx) = test_sender(1);
        let (r, _rrx) = test_sender(2);
        let id = room_of(&reg.create_room(&s, Instant::now()));
        reg.update_offer(
            &s,
            DescriptionUpdate {
                id: id.clone(),
                description: SessionDescription::offer("o"),
            },
            Instant::now(),
        );
        reg.get_offer(&r, RoomRef { id: id.clone() });

        let out = reg.create_answer(
            &r,
            DescriptionUpdate {
                id: id.clone(),
                description: SessionDescription::answer("a"),
            },
        );
        assert_eq!(targets(&out), vec![ConnId(1)]);
        assert_eq!(
            out[0].1,
            RelayMessage::answer(id, SessionDescription::answer("a"))
        );
    }

    #[tokio::test]
    async fn candidates_forward_to_opposite_role() {
        let mut reg = registry();
        let (s, _srx) = test_sender(1);
        let (r, _rrx) = test_sender(2);
        let id = room_of(&reg.create_room(&s, Instant::now()));
        reg.update_offer(
            &s,
            DescriptionUpdate {
                id: id.clone(),
                description: SessionDescription::offer("o"),
            },
            Instant::now(),
        );
        reg.get_offer(&r, RoomRef { id: id.clone() });

        let to_sender = reg.ice_update(
            &r,
            IceUpdate {
                id: id.clone(),
                peer: PeerRole::Receiver,
                ice_candidate: candidate(9),
            },
        );
        assert_eq!(targets(&to_sender), vec![ConnId(1)]);

        let to_receiver = reg.ice_update(
            &s,
            IceUpdate {
                id,
                peer: PeerRole::Sender,
                ice_candidate: candidate(3),
            },
        );
        assert_eq!(targets(&to_receiver), vec![ConnId(2)]);
    }

    #[tokio::test]
    async fn receiver_candidates_are_forwarded_not_kept() {
        let mut reg = registry();
        let (s, _srx) = test_sender(1);
        let (r, _rrx) = test_sender(2);
        let id = room_of(&reg.create_room(&s, Instant::now()));
        reg.update_offer(
            &s,
            DescriptionUpdate {
                id: id.clone(),
                description: SessionDescription::offer("o"),
            },
            Instant::now(),
        );
        reg.get_offer(&r, RoomRef { id: id.clone() });

        for n in 1..=50 {
            let out = reg.ice_update(
                &r,
                IceUpdate {
                    id: id.clone(),
                    peer: PeerRole::Receiver,
                    ice_candidate: candidate(n),
                },
            );
            assert_eq!(targets(&out), vec![ConnId(1)]);
        }
        assert_eq!(reg.stored_candidates(&id), 0);

        reg.ice_update(
            &s,
            IceUpdate {
                id: id.clone(),
                peer: PeerRole::Sender,
                ice_candidate: candidate(1),
            },
        );
        assert_eq!(reg.stored_candidates(&id), 1);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let mut reg = registry();
        let (s1, _a) = test_sender(1);
        let (s2, _b) = test_sender(2);
        let (r1, _c) = test_sender(3);
        let (r2, _d) = test_sender(4);
        let room1 = room_of(&reg.create_room(&s1, Instant::now()));
        let room2 = room_of(&reg.create_room(&s2, Instant::now()));
        assert_ne!(room1, room2);

        for (s, id, sdp) in [(&s1, &room1, "offer-1"), (&s2, &room2, "offer-2")] {
            reg.update_offer(
                s,
                DescriptionUpdate {
                    id: id.clone(),
                    description: SessionDescription::offer(sdp),
                },
                Instant::now(),
            );
        }

        let out = reg.get_offer(&r2, RoomRef { id: room2.clone() });
        assert_eq!(out[0].1.description().unwrap().sdp, "offer-2");
        let out = reg.get_offer(&r1, RoomRef { id: room1.clone() });
        assert_eq!(out[0].1.description().unwrap().sdp, "offer-1");

        let out = reg.create_answer(
            &r2,
            DescriptionUpdate {
                id: room2.clone(),
                description: SessionDescription::answer("answer-2"),
            },
        );
        assert_eq!(targets(&out), vec![ConnId(2)]);

        let out = reg.ice_update(
            &s1,
            IceUpdate {
                id: room1,
                peer: PeerRole::Sender,
                ice_candidate: candidate(1),
            },
        );
        assert_eq!(targets(&out), vec![ConnId(3)]);
    }

    #[tokio::test]
    async fn sender_disconnect_removes_room() {
        let mut reg = registry();
        let (s, _srx) = test_sender(1);
        let (other, _orx) = test_sender(2);
        let id = room_of(&reg.create_room(&s, Instant::now()));
        reg.create_room(&other, Instant::now());

        assert_eq!(reg.disconnect(ConnId(1)), 1);
        assert!(!reg.contains(&id));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_rooms_are_swept() {
        let mut reg = RoomRegistry::new(100, Duration::from_secs(60));
        let (s, _srx) = test_sender(1);
        let (r, _rrx) = test_sender(2);
        let old = room_of(&reg.create_room(&s, Instant::now()));
        reg.update_offer(
            &s,
            DescriptionUpdate {
                id: old.clone(),
                description: SessionDescription::offer("o"),
            },
            Instant::now(),
        );

        tokio::time::advance(Duration::from_secs(45)).await;
        let fresh = room_of(&reg.create_room(&s, Instant::now()));
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(reg.sweep_expired(Instant::now()), 1);
        assert!(reg.contains(&fresh));
        let out = reg.get_offer(&r, RoomRef { id: old });
        assert!(matches!(out[0].1, RelayMessage::Error { .. }));
    }

    #[tokio::test]
    async fn rooms_handler_delivers_through_senders() {
        let rooms = Rooms::new(registry());
        let (s, mut srx) = test_sender(1);
        rooms.on_create_room(s.clone()).await;

        let msgs = drain(&mut srx);
        assert!(matches!(msgs[..], [RelayMessage::CreateRoom { .. }]));
        assert_eq!(rooms.room_count(), 1);

        rooms.on_disconnected(s.id()).await;
        assert_eq!(rooms.room_count(), 0);
    }
}
