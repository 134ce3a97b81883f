//! In-process loopback transport.
//!
//! [`MemoryNetwork`] hands out peer connections that find each other
//! through the tokens embedded in their offers and answers. A pair is
//! linked once the offerer holds the answer and both sides have applied
//! at least one remote ICE candidate, so signaling has to work end to end
//! for the link to come up.
//!
//! Each linked data channel has one delivery pump per direction. A sent
//! message counts towards the sender's buffered amount until the pump has
//! handed it to the remote end; crossing down to the low threshold fires
//! [`ChannelEvent::BufferedAmountLow`]. Delivery can be paused through a
//! [`MemoryLink`] to hold data in the buffer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use toasty_protocol::{IceCandidate, SdpType, SessionDescription};

use crate::channel::{
    ChannelEvent, ChannelEvents, ChannelMessage, ChannelState, DataChannel, DataChannelHandle,
};
use crate::peer::{PeerConnection, PeerEvent, PeerEvents, PeerFactory, PeerState};
use crate::{TransportError, TransportFuture};

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

// ---------------------------------------------------------------------------
// Data channels
// ---------------------------------------------------------------------------

enum Outgoing {
    Message(ChannelMessage),
    Close,
    Halt,
}

struct LinkSide {
    outbox: mpsc::UnboundedSender<Outgoing>,
}

struct ChannelEnd {
    label: String,
    state: Mutex<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    buffered: AtomicUsize,
    low_threshold: AtomicUsize,
    link: Mutex<Option<LinkSide>>,
}

impl ChannelEnd {
    fn new(label: &str) -> (Arc<Self>, ChannelEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let end = Arc::new(Self {
            label: label.to_owned(),
            state: Mutex::new(ChannelState::Connecting),
            events,
            buffered: AtomicUsize::new(0),
            low_threshold: AtomicUsize::new(0),
            link: Mutex::new(None),
        });
        (end, rx)
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn open(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Open;
            drop(state);
            self.emit(ChannelEvent::Open);
        }
    }

    /// Moves to `Closed`, emitting the event and stopping the pump once.
    fn finish_close(&self) {
        let prev = std::mem::replace(&mut *self.state.lock().unwrap(), ChannelState::Closed);
        if prev == ChannelState::Closed {
            return;
        }
        if let Some(link) = self.link.lock().unwrap().as_ref() {
            let _ = link.outbox.send(Outgoing::Halt);
        }
        trace!(label = %self.label, "memory channel closed");
        self.emit(ChannelEvent::Closed);
    }

    /// Accounts for a delivered message.
    fn release(&self, len: usize) {
        let prev = self.buffered.fetch_sub(len, Ordering::SeqCst);
        let now = prev - len;
        let threshold = self.low_threshold.load(Ordering::SeqCst);
        if prev > threshold && now <= threshold && self.state() != ChannelState::Closed {
            self.emit(ChannelEvent::BufferedAmountLow);
        }
    }
}

/// A cloneable view of one end of a memory channel.
struct MemoryChannel {
    end: Arc<ChannelEnd>,
    remote: Mutex<Weak<ChannelEnd>>,
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.end.label
    }

    fn ready_state(&self) -> ChannelState {
        self.end.state()
    }

    fn send(&self, message: ChannelMessage) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let state = self.end.state();
            if state != ChannelState::Open {
                return Err(TransportError::ChannelNotOpen(state));
            }
            let len = message.len();
            self.end.buffered.fetch_add(len, Ordering::SeqCst);
            let link = self.end.link.lock().unwrap();
            let sent = link
                .as_ref()
                .map(|l| l.outbox.send(Outgoing::Message(message)).is_ok())
                .unwrap_or(false);
            if !sent {
                self.end.buffered.fetch_sub(len, Ordering::SeqCst);
                return Err(TransportError::ChannelNotOpen(ChannelState::Closed));
            }
            Ok(())
        })
    }

    fn buffered_amount(&self) -> usize {
        self.end.buffered.load(Ordering::SeqCst)
    }

    fn buffered_amount_low_threshold(&self) -> usize {
        self.end.low_threshold.load(Ordering::SeqCst)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.end.low_threshold.store(threshold, Ordering::SeqCst);
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.end.state.lock().unwrap();
            match *state {
                ChannelState::Open => {
                    *state = ChannelState::Closing;
                    drop(state);
                    if let Some(link) = self.end.link.lock().unwrap().as_ref() {
                        let _ = link.outbox.send(Outgoing::Close);
                    }
                }
                ChannelState::Connecting => {
                    drop(state);
                    close_now(&self.end, &self.remote.lock().unwrap());
                }
                ChannelState::Closing | ChannelState::Closed => {}
            }
            Ok(())
        })
    }
}

fn close_now(end: &Arc<ChannelEnd>, remote: &Weak<ChannelEnd>) {
    end.finish_close();
    if let Some(remote) = remote.upgrade() {
        remote.finish_close();
    }
}

fn handle_for(end: Arc<ChannelEnd>, events: ChannelEvents) -> (Arc<MemoryChannel>, DataChannelHandle) {
    let channel = Arc::new(MemoryChannel {
        end,
        remote: Mutex::new(Weak::new()),
    });
    let handle = DataChannelHandle {
        channel: channel.clone(),
        events,
    };
    (channel, handle)
}

/// Connects two channel ends, spawns their pumps, and opens both.
fn pair(a: &Arc<MemoryChannel>, b: &Arc<MemoryChannel>, gate: watch::Receiver<bool>) {
    *a.remote.lock().unwrap() = Arc::downgrade(&b.end);
    *b.remote.lock().unwrap() = Arc::downgrade(&a.end);

    for (from, to) in [(&a.end, &b.end), (&b.end, &a.end)] {
        let (outbox, rx) = mpsc::unbounded_channel();
        *from.link.lock().unwrap() = Some(LinkSide { outbox });
        tokio::spawn(pump(from.clone(), to.clone(), rx, gate.clone()));
    }

    a.end.open();
    b.end.open();
}

async fn pump(
    from: Arc<ChannelEnd>,
    to: Arc<ChannelEnd>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    mut gate: watch::Receiver<bool>,
) {
    while let Some(item) = rx.recv().await {
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        match item {
            Outgoing::Message(message) => {
                let len = message.len();
                if to.state() == ChannelState::Open || to.state() == ChannelState::Closing {
                    to.emit(ChannelEvent::Message(message));
                }
                from.release(len);
            }
            Outgoing::Close => {
                from.finish_close();
                to.finish_close();
                break;
            }
            Outgoing::Halt => break,
        }
    }
}

/// Controls delivery on memory links.
#[derive(Clone)]
pub struct MemoryLink {
    gate: Arc<watch::Sender<bool>>,
}

impl MemoryLink {
    fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            gate: Arc::new(gate),
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    /// Holds delivery: sent messages stay in the sender's buffer.
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }
}

/// Creates two already-open, directly linked channel ends.
///
/// Must be called from within a tokio runtime.
pub fn channel_pair(label: &str) -> (MemoryLink, DataChannelHandle, DataChannelHandle) {
    let link = MemoryLink::new();
    let (a_end, a_events) = ChannelEnd::new(label);
    let (b_end, b_events) = ChannelEnd::new(label);
    let (a, a_handle) = handle_for(a_end, a_events);
    let (b, b_handle) = handle_for(b_end, b_events);
    pair(&a, &b, link.subscribe());
    (link, a_handle, b_handle)
}

// ---------------------------------------------------------------------------
// Peer connections
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PeerShared {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_id: Option<String>,
    channels: Vec<Arc<MemoryChannel>>,
    negotiation_fired: bool,
    applied_candidates: usize,
    closed: bool,
    linked: bool,
}

struct PeerInner {
    id: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    shared: Mutex<PeerShared>,
}

impl PeerInner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct NetworkInner {
    peers: HashMap<String, Weak<PeerInner>>,
    links: HashMap<String, MemoryLink>,
    linked: HashSet<String>,
}

/// Factory for loopback peer connections that can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_peer(&self) -> (MemoryPeer, PeerEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PeerInner {
            id: uuid::Uuid::new_v4().simple().to_string(),
            events,
            shared: Mutex::new(PeerShared::default()),
        });
        self.inner
            .lock()
            .unwrap()
            .peers
            .insert(inner.id.clone(), Arc::downgrade(&inner));
        let peer = MemoryPeer {
            inner,
            network: self.clone(),
        };
        (peer, rx)
    }

    /// Number of peer pairs that have been linked so far.
    pub fn linked_pairs(&self) -> usize {
        self.inner.lock().unwrap().linked.len()
    }

    fn lookup(&self, id: &str) -> Option<Arc<PeerInner>> {
        self.inner.lock().unwrap().peers.get(id).and_then(Weak::upgrade)
    }

    /// Links a peer with its counterpart once both sides are ready.
    fn try_link(&self, peer: &Arc<PeerInner>) {
        let mut net = self.inner.lock().unwrap();

        let (local_type, remote_id) = {
            let s = peer.shared.lock().unwrap();
            (s.local.as_ref().map(|d| d.sdp_type), s.remote_id.clone())
        };
        let Some(other) = remote_id
            .as_deref()
            .and_then(|id| net.peers.get(id))
            .and_then(Weak::upgrade)
        else {
            return;
        };
        let (offerer, answerer) = match local_type {
            Some(SdpType::Offer) => (peer.clone(), other),
            Some(SdpType::Answer) => (other, peer.clone()),
            _ => return,
        };
        if net.linked.contains(&offerer.id) {
            return;
        }

        let offer_side_ready = {
            let s = offerer.shared.lock().unwrap();
            !s.closed
                && s.remote.as_ref().map(|d| d.sdp_type) == Some(SdpType::Answer)
                && s.remote_id.as_deref() == Some(answerer.id.as_str())
                && s.applied_candidates > 0
        };
        let answer_side_ready = {
            let s = answerer.shared.lock().unwrap();
            !s.closed
                && s.remote.as_ref().map(|d| d.sdp_type) == Some(SdpType::Offer)
                && s.local.as_ref().map(|d| d.sdp_type) == Some(SdpType::Answer)
                && s.applied_candidates > 0
        };
        if !offer_side_ready || !answer_side_ready {
            return;
        }

        net.linked.insert(offerer.id.clone());
        let link = MemoryLink::new();
        net.links.insert(offerer.id.clone(), link.clone());
        drop(net);

        debug!(offerer = %offerer.id, answerer = %answerer.id, "memory peers linked");

        let channels = {
            let mut s = offerer.shared.lock().unwrap();
            s.linked = true;
            s.channels.clone()
        };
        answerer.shared.lock().unwrap().linked = true;

        for local in channels {
            open_remote_channel(&local, &answerer, &link);
        }

        for p in [&offerer, &answerer] {
            p.emit(PeerEvent::StateChanged(PeerState::Connected));
        }
    }

    fn link_for(&self, offerer_id: &str) -> Option<MemoryLink> {
        self.inner.lock().unwrap().links.get(offerer_id).cloned()
    }
}

impl PeerFactory for MemoryNetwork {
    fn create(&self) -> Result<(Arc<dyn PeerConnection>, PeerEvents), TransportError> {
        let (peer, events) = self.create_peer();
        Ok((Arc::new(peer), events))
    }
}

/// Mirrors a locally created channel on the answering peer and opens both.
fn open_remote_channel(local: &Arc<MemoryChannel>, answerer: &Arc<PeerInner>, link: &MemoryLink) {
    let (end, events) = ChannelEnd::new(&local.end.label);
    let (remote, handle) = handle_for(end, events);
    answerer.shared.lock().unwrap().channels.push(remote.clone());
    answerer.emit(PeerEvent::DataChannel(handle));
    pair(local, &remote, link.subscribe());
}

/// A loopback peer connection.
pub struct MemoryPeer {
    inner: Arc<PeerInner>,
    network: MemoryNetwork,
}

impl MemoryPeer {
    /// Delivery control for this peer's data channels, once linked.
    pub fn link(&self) -> Option<MemoryLink> {
        let s = self.inner.shared.lock().unwrap();
        let offerer_id = match s.local.as_ref().map(|d| d.sdp_type) {
            Some(SdpType::Offer) => self.inner.id.clone(),
            _ => s.remote_id.clone()?,
        };
        drop(s);
        self.network.link_for(&offerer_id)
    }

    fn gather_candidates(&self) {
        let candidate = IceCandidate {
            candidate: format!("candidate:memory 1 udp 2122260223 {} 9 typ host", self.inner.id),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        self.inner.emit(PeerEvent::IceCandidate(Some(candidate)));
        self.inner
            .emit(PeerEvent::IceCandidate(Some(IceCandidate::new(""))));
        self.inner.emit(PeerEvent::IceCandidate(None));
    }
}

fn parse_token(description: &SessionDescription) -> Result<String, TransportError> {
    let prefix = match description.sdp_type {
        SdpType::Offer => OFFER_PREFIX,
        SdpType::Answer => ANSWER_PREFIX,
        other => {
            return Err(TransportError::InvalidDescription(format!(
                "unsupported description type {other:?}"
            )));
        }
    };
    description
        .sdp
        .strip_prefix(prefix)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| TransportError::InvalidDescription("unrecognised sdp".into()))
}

impl PeerConnection for MemoryPeer {
    fn create_data_channel(&self, label: &str) -> TransportFuture<'_, DataChannelHandle> {
        let label = label.to_owned();
        Box::pin(async move {
            let (end, events) = ChannelEnd::new(&label);
            let (channel, handle) = handle_for(end, events);

            let (fire, linked, remote_id) = {
                let mut s = self.inner.shared.lock().unwrap();
                if s.closed {
                    return Err(TransportError::PeerClosed);
                }
                s.channels.push(channel.clone());
                let fire = !s.negotiation_fired;
                s.negotiation_fired = true;
                (fire, s.linked, s.remote_id.clone())
            };

            if linked {
                let answerer = remote_id.and_then(|id| self.network.lookup(&id));
                let link = self.network.link_for(&self.inner.id);
                if let (Some(answerer), Some(link)) = (answerer, link) {
                    open_remote_channel(&channel, &answerer, &link);
                }
            } else if fire {
                self.inner.emit(PeerEvent::NegotiationNeeded);
            }
            Ok(handle)
        })
    }

    fn create_offer(&self) -> TransportFuture<'_, SessionDescription> {
        Box::pin(async move {
            if self.inner.shared.lock().unwrap().closed {
                return Err(TransportError::PeerClosed);
            }
            Ok(SessionDescription::offer(format!(
                "{OFFER_PREFIX}{}",
                self.inner.id
            )))
        })
    }

    fn create_answer(&self) -> TransportFuture<'_, SessionDescription> {
        Box::pin(async move {
            let s = self.inner.shared.lock().unwrap();
            if s.closed {
                return Err(TransportError::PeerClosed);
            }
            if s.remote.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer) {
                return Err(TransportError::NoRemoteDescription);
            }
            Ok(SessionDescription::answer(format!(
                "{ANSWER_PREFIX}{}",
                self.inner.id
            )))
        })
    }

    fn set_local_description(&self, description: SessionDescription) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let token = parse_token(&description)?;
            if token != self.inner.id {
                return Err(TransportError::InvalidDescription(
                    "local description belongs to another peer".into(),
                ));
            }
            {
                let mut s = self.inner.shared.lock().unwrap();
                if s.closed {
                    return Err(TransportError::PeerClosed);
                }
                s.local = Some(description);
            }
            self.inner
                .emit(PeerEvent::StateChanged(PeerState::Connecting));
            self.gather_candidates();
            self.network.try_link(&self.inner);
            Ok(())
        })
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let token = parse_token(&description)?;
            if self.network.lookup(&token).is_none() {
                return Err(TransportError::InvalidDescription(format!(
                    "no peer for token {token}"
                )));
            }
            {
                let mut s = self.inner.shared.lock().unwrap();
                if s.closed {
                    return Err(TransportError::PeerClosed);
                }
                s.remote = Some(description);
                s.remote_id = Some(token);
            }
            self.network.try_link(&self.inner);
            Ok(())
        })
    }

    fn has_remote_description(&self) -> bool {
        self.inner.shared.lock().unwrap().remote.is_some()
    }

    fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            {
                let mut s = self.inner.shared.lock().unwrap();
                if s.closed {
                    return Err(TransportError::PeerClosed);
                }
                if s.remote.is_none() {
                    return Err(TransportError::NoRemoteDescription);
                }
                if candidate.is_end_of_candidates() {
                    return Ok(());
                }
                s.applied_candidates += 1;
            }
            self.network.try_link(&self.inner);
            Ok(())
        })
    }

    fn connection_state(&self) -> PeerState {
        let s = self.inner.shared.lock().unwrap();
        if s.closed {
            PeerState::Closed
        } else if s.linked {
            PeerState::Connected
        } else if s.local.is_some() {
            PeerState::Connecting
        } else {
            PeerState::New
        }
    }

    fn close(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let channels = {
                let mut s = self.inner.shared.lock().unwrap();
                if s.closed {
                    return Ok(());
                }
                s.closed = true;
                std::mem::take(&mut s.channels)
            };
            for channel in channels {
                close_now(&channel.end, &channel.remote.lock().unwrap());
            }
            debug!(peer = %self.inner.id, "memory peer closed");
            self.inner.emit(PeerEvent::StateChanged(PeerState::Closed));
            Ok(())
        })
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        if let Ok(mut net) = self.network.inner.lock() {
            net.peers.remove(&self.inner.id);
        }
    }
}
