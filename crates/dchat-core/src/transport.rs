use crate::router::lock;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::fmt;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

/// Abstract requests issued to the transport collaborator.
///
/// Key material is carried as opaque bytes; the collaborator owns the wire
/// format, encryption, and delivery.
#[derive(Clone, PartialEq, Eq)]
pub enum TransportRequest {
    IdentitySet {
        nickname: String,
    },
    KeyPairSet {
        private_key: Vec<u8>,
        public_key: Vec<u8>,
    },
    FriendKeyAdded {
        peer_id: String,
        public_key: Vec<u8>,
    },
    GroupKeyAdded {
        group_id: String,
        symmetric_key: Vec<u8>,
    },
    DirectJoinRequested {
        peer_id: String,
    },
    GroupJoinRequested {
        group_id: String,
    },
    DirectSendRequested {
        peer_id: String,
        plaintext: String,
    },
    GroupSendRequested {
        group_id: String,
        plaintext: String,
    },
}

impl TransportRequest {
    pub fn name(&self) -> &'static str {
        match self {
            TransportRequest::IdentitySet { .. } => "identitySet",
            TransportRequest::KeyPairSet { .. } => "keyPairSet",
            TransportRequest::FriendKeyAdded { .. } => "friendKeyAdded",
            TransportRequest::GroupKeyAdded { .. } => "groupKeyAdded",
            TransportRequest::DirectJoinRequested { .. } => "directJoinRequested",
            TransportRequest::GroupJoinRequested { .. } => "groupJoinRequested",
            TransportRequest::DirectSendRequested { .. } => "directSendRequested",
            TransportRequest::GroupSendRequested { .. } => "groupSendRequested",
        }
    }

    /// Peer or group the request concerns, if any.
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            TransportRequest::IdentitySet { .. } | TransportRequest::KeyPairSet { .. } => None,
            TransportRequest::FriendKeyAdded { peer_id, .. }
            | TransportRequest::DirectJoinRequested { peer_id }
            | TransportRequest::DirectSendRequested { peer_id, .. } => Some(peer_id),
            TransportRequest::GroupKeyAdded { group_id, .. }
            | TransportRequest::GroupJoinRequested { group_id }
            | TransportRequest::GroupSendRequested { group_id, .. } => Some(group_id),
        }
    }
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject_id() {
            Some(id) => write!(f, "{}({})", self.name(), id),
            None => f.write_str(self.name()),
        }
    }
}

/// Outbound half of the core: hands requests to whatever moves bytes.
pub trait ChatTransport: Send + Sync {
    /// Issue a request. Must not block on the collaborator's acknowledgement.
    fn request(&self, request: TransportRequest) -> Pending;
}

/// Completion handle for a transport request.
///
/// Clones share one outcome: whichever clone observes the acknowledgement
/// first records it for the others.
#[derive(Clone)]
pub struct Pending {
    id: String,
    shared: Arc<Shared>,
}

struct Shared {
    rx: Receiver<Result<()>>,
    outcome: Mutex<Option<Result<()>>>,
}

impl Pending {
    /// A handle plus the acknowledger the collaborator completes it with.
    pub fn channel(id: impl Into<String>) -> (Pending, Acknowledger) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (
            Pending {
                id: id.into(),
                shared: Arc::new(Shared {
                    rx,
                    outcome: Mutex::new(None),
                }),
            },
            Acknowledger { tx },
        )
    }

    /// An already completed handle.
    pub fn ready(id: impl Into<String>, result: Result<()>) -> Pending {
        let (pending, ack) = Pending::channel(id);
        ack.complete(result);
        pending
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Block until the collaborator acknowledges.
    pub fn wait(self) -> Result<()> {
        let mut outcome = lock(&self.shared.outcome);
        if outcome.is_none() {
            let result = self
                .shared
                .rx
                .recv()
                .unwrap_or_else(|_| Err(dropped(&self.id)));
            *outcome = Some(result);
        }
        outcome.clone().unwrap_or_else(|| Err(dropped(&self.id)))
    }

    /// Block for at most `timeout`. `None` if still outstanding.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut outcome = lock(&self.shared.outcome);
        if outcome.is_none() {
            match self.shared.rx.recv_timeout(timeout) {
                Ok(result) => *outcome = Some(result),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => *outcome = Some(Err(dropped(&self.id))),
            }
        }
        outcome.clone()
    }

    /// Non-blocking poll. `None` if still outstanding, including while
    /// another clone is blocked waiting for it.
    pub fn try_result(&self) -> Option<Result<()>> {
        let mut outcome = match self.shared.outcome.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        if outcome.is_none() {
            match self.shared.rx.try_recv() {
                Ok(result) => *outcome = Some(result),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => *outcome = Some(Err(dropped(&self.id))),
            }
        }
        outcome.clone()
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.shared.outcome.try_lock() {
            Ok(guard) => guard.clone(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
            Err(TryLockError::WouldBlock) => None,
        };
        f.debug_struct("Pending")
            .field("id", &self.id)
            .field("outcome", &outcome)
            .finish()
    }
}

fn dropped(id: &str) -> Error {
    Error::Transport(format!("request {id} dropped without acknowledgement"))
}

/// Collaborator side of a [`Pending`].
pub struct Acknowledger {
    tx: Sender<Result<()>>,
}

impl Acknowledger {
    pub fn complete(self, result: Result<()>) {
        // Caller may have dropped its handle; nothing to report then.
        let _ = self.tx.send(result);
    }

    pub fn ack(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, message: impl Into<String>) {
        self.complete(Err(Error::Transport(message.into())));
    }
}

/// A request as seen by the collaborator behind [`ChannelTransport`].
pub struct OutboundRequest {
    pub id: String,
    pub request: TransportRequest,
    pub ack: Acknowledger,
}

/// Channel-based [`ChatTransport`]: forwards every request to a receiver the
/// host drains and acknowledges on its own schedule.
#[derive(Clone)]
pub struct ChannelTransport {
    request_tx: Sender<OutboundRequest>,
}

impl ChannelTransport {
    pub fn new(request_tx: Sender<OutboundRequest>) -> Self {
        Self { request_tx }
    }

    pub fn unbounded() -> (Self, Receiver<OutboundRequest>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }
}

impl ChatTransport for ChannelTransport {
    fn request(&self, request: TransportRequest) -> Pending {
        let id = format!("req-{}", uuid::Uuid::new_v4());
        let (pending, ack) = Pending::channel(id.clone());
        tracing::debug!(request_id = %id, ?request, "transport request");
        if self
            .request_tx
            .send(OutboundRequest { id, request, ack })
            .is_err()
        {
            return Pending::ready(pending.id(), Err(Error::Closed));
        }
        pending
    }
}
