//! One transfer attempt at a time, from room creation to the last byte.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use toasty_protocol::constants::data_channel_label;
use toasty_protocol::{FileMetadata, RoomId};
use toasty_transfer::{
    ChunkedReceiver, ChunkedSender, OutgoingFile, ReceivedFile, SendOutcome, TransferError,
    TransferEvent, TransferProgress,
};
use toasty_transport::{PeerConnection, PeerEvents, PeerFactory, PeerState, TransportError};

use crate::negotiation::{NegotiationCoordinator, NegotiationEvent, NegotiationRole};
use crate::{SessionConfig, SessionError};

/// What a successful attempt produced.
#[derive(Debug)]
pub enum TransferArtifact {
    Sent(SendOutcome),
    Received(ReceivedFile),
}

/// Notifications for the embedding application.
#[derive(Debug)]
pub enum SessionEvent {
    /// The sender's room exists; its id is what the receiver needs.
    RoomReady(RoomId),
    /// The receiver learned what is coming.
    FileInfo(FileMetadata),
    Progress(TransferProgress),
    Completed(TransferArtifact),
    Failed(SessionError),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

type TransferFuture = Pin<Box<dyn Future<Output = Result<TransferArtifact, TransferError>> + Send>>;

struct Attempt {
    cancel: CancellationToken,
    peer: Arc<dyn PeerConnection>,
    task: JoinHandle<()>,
}

/// Runs send or receive attempts over fresh peer connections.
///
/// Each attempt creates its own peer connection and relay connection, so
/// state never leaks from one attempt into the next.
pub struct Session {
    config: SessionConfig,
    factory: Arc<dyn PeerFactory>,
    events: mpsc::UnboundedSender<SessionEvent>,
    attempt: Option<Attempt>,
}

impl Session {
    pub fn new(config: SessionConfig, factory: Arc<dyn PeerFactory>) -> (Self, SessionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            factory,
            events,
            attempt: None,
        };
        (session, rx)
    }

    /// `true` while an attempt is still running.
    pub fn is_busy(&self) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|attempt| !attempt.task.is_finished())
    }

    /// Starts sending `file`. [`SessionEvent::RoomReady`] follows once the
    /// relay assigned a room.
    pub fn send_file(&mut self, file: OutgoingFile) -> Result<(), SessionError> {
        self.start(Plan::Send(file))
    }

    /// Starts receiving from the sender waiting in `room`.
    pub fn receive(&mut self, room: RoomId) -> Result<(), SessionError> {
        self.start(Plan::Receive(room))
    }

    fn start(&mut self, plan: Plan) -> Result<(), SessionError> {
        if self.is_busy() {
            return Err(SessionError::Busy);
        }
        self.attempt = None;

        let (peer, peer_events) = self.factory.create()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_attempt(
            plan,
            self.config.clone(),
            Arc::clone(&peer),
            peer_events,
            self.events.clone(),
            cancel.clone(),
        ));
        self.attempt = Some(Attempt { cancel, peer, task });
        Ok(())
    }

    /// Ends the current transfer now by closing the peer connection. The
    /// attempt reports how far it got.
    pub async fn end(&self) {
        if let Some(attempt) = &self.attempt {
            info!("ending transfer");
            if let Err(e) = attempt.peer.close().await {
                warn!("closing peer connection: {e}");
            }
        }
    }

    /// Abandons the current attempt and forgets it, leaving the session
    /// ready for a new one.
    pub async fn reset(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        debug!("resetting session");
        attempt.cancel.cancel();
        if let Err(e) = attempt.peer.close().await {
            warn!("closing peer connection: {e}");
        }
        let _ = attempt.task.await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(attempt) = &self.attempt {
            attempt.cancel.cancel();
        }
    }
}

enum Plan {
    Send(OutgoingFile),
    Receive(RoomId),
}

async fn run_attempt(
    plan: Plan,
    config: SessionConfig,
    peer: Arc<dyn PeerConnection>,
    peer_events: PeerEvents,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    let result = drive(plan, &config, &peer, peer_events, &events, &cancel).await;

    if cancel.is_cancelled() {
        debug!("attempt cancelled");
        return;
    }
    let event = match result {
        Ok(artifact) => {
            info!("transfer completed");
            SessionEvent::Completed(artifact)
        }
        Err(e) => {
            warn!("transfer failed: {e}");
            SessionEvent::Failed(e)
        }
    };
    let _ = events.send(event);

    if let Err(e) = peer.close().await {
        debug!("closing peer connection: {e}");
    }
}

async fn drive(
    plan: Plan,
    config: &SessionConfig,
    peer: &Arc<dyn PeerConnection>,
    peer_events: PeerEvents,
    events: &mpsc::UnboundedSender<SessionEvent>,
    cancel: &CancellationToken,
) -> Result<TransferArtifact, SessionError> {
    let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();

    let (role, mut transfer): (NegotiationRole, Option<TransferFuture>) = match plan {
        Plan::Send(file) => {
            // The channel must exist before negotiation starts: creating it is
            // what asks for a room.
            let label = data_channel_label(&file.metadata().name);
            let handle = peer.create_data_channel(&label).await?;
            let sender = ChunkedSender::new(handle, config.transfer.clone());
            let tx = transfer_tx.clone();
            let fut: TransferFuture = Box::pin(async move {
                let outcome = sender.send(file, tx).await?;
                if outcome.is_complete() {
                    Ok(TransferArtifact::Sent(outcome))
                } else {
                    Err(TransferError::Incomplete {
                        fraction: outcome.fraction,
                    })
                }
            });
            (NegotiationRole::Sender, Some(fut))
        }
        Plan::Receive(room) => (NegotiationRole::Receiver(room), None),
    };

    let (neg_tx, mut neg_rx) = mpsc::unbounded_channel();
    let coordinator = NegotiationCoordinator::connect(
        &config.relay_url,
        role,
        Arc::clone(peer),
        peer_events,
        neg_tx,
    )
    .await?;
    let negotiation = coordinator.run(cancel.child_token());
    tokio::pin!(negotiation);
    let mut negotiating = true;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Transport(TransportError::PeerClosed)),

            res = &mut negotiation, if negotiating => {
                negotiating = false;
                if let Err(e) = res {
                    return Err(e.into());
                }
            }

            Some(ev) = neg_rx.recv() => match ev {
                NegotiationEvent::RoomAssigned(room) => {
                    let _ = events.send(SessionEvent::RoomReady(room));
                }
                NegotiationEvent::DataChannel(handle) => {
                    if transfer.is_none() {
                        let receiver = ChunkedReceiver::new(handle, config.transfer.clone());
                        let tx = transfer_tx.clone();
                        let fut: TransferFuture = Box::pin(async move {
                            receiver.receive(tx).await.map(TransferArtifact::Received)
                        });
                        transfer = Some(fut);
                    } else {
                        debug!("ignoring extra data channel");
                    }
                }
                NegotiationEvent::PeerState(PeerState::Failed) => {
                    return Err(SessionError::Transport(TransportError::Failed(
                        "peer connection failed".into(),
                    )));
                }
                NegotiationEvent::PeerState(state) => trace!(?state, "peer state"),
            },

            Some(ev) = transfer_rx.recv() => forward(events, ev),

            res = poll_transfer(&mut transfer) => break res,
        }
    };

    while let Ok(ev) = transfer_rx.try_recv() {
        forward(events, ev);
    }
    Ok(result?)
}

fn forward(events: &mpsc::UnboundedSender<SessionEvent>, event: TransferEvent) {
    let event = match event {
        TransferEvent::Metadata(metadata) => SessionEvent::FileInfo(metadata),
        TransferEvent::Progress(progress) => SessionEvent::Progress(progress),
    };
    let _ = events.send(event);
}

/// The transfer's result, or never while there is no transfer yet.
async fn poll_transfer(
    transfer: &mut Option<TransferFuture>,
) -> Result<TransferArtifact, TransferError> {
    match transfer {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
