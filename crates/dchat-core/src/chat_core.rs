use crate::conversation::{resolve_direct, resolve_group};
use crate::router::{lock, Subscription};
use crate::utils::{generate_user_id, require_non_empty};
use crate::{
    ChatCoreOptions, ChatSession, ChatTransport, ConversationId, ConversationTarget,
    CoreNotification, DecryptedMessageEvent, Error, ErrorNotice, FriendKey, GroupKey, Identity,
    InboundEvent, KeyStore, MessageRouter, Pending, Result, TransportRequest,
    DIRECT_DISPLAY_PREFIX, GROUP_DISPLAY_PREFIX,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cloneable producer handle for transport threads delivering inbound events.
#[derive(Clone)]
pub struct InboundSender {
    tx: Sender<InboundEvent>,
}

impl InboundSender {
    pub fn send(&self, event: InboundEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| Error::Closed)
    }

    pub fn decrypted_message(&self, message: DecryptedMessageEvent) -> Result<()> {
        self.send(InboundEvent::DecryptedMessage(message))
    }

    pub fn transport_error(
        &self,
        message: impl Into<String>,
        timestamp_iso: Option<String>,
    ) -> Result<()> {
        self.send(InboundEvent::TransportError {
            message: message.into(),
            timestamp_iso,
        })
    }
}

/// Entry point for a UI or automation layer.
///
/// Owns one key store and one session registry. Inbound events are either
/// handed over directly with [`ChatCore::handle_event`] or queued through an
/// [`InboundSender`] and drained with [`ChatCore::process_pending`]; either
/// way they are processed one at a time. An event handed to
/// [`ChatCore::handle_event`] from inside a subscriber callback is queued
/// instead, for the next [`ChatCore::process_pending`].
pub struct ChatCore {
    key_store: Mutex<KeyStore>,
    router: MessageRouter,
    transport: Arc<dyn ChatTransport>,
    /// Latest join request per conversation. Lock before `key_store`.
    joins: Mutex<HashMap<ConversationId, Pending>>,
    inbound_tx: Sender<InboundEvent>,
    inbound_rx: Receiver<InboundEvent>,
}

impl ChatCore {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            key_store: Mutex::new(KeyStore::new(generate_user_id())),
            router: MessageRouter::new(ChatCoreOptions::default().ignore_own_echo),
            transport,
            joins: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn with_options(transport: Arc<dyn ChatTransport>, options: ChatCoreOptions) -> Result<Self> {
        let local_id = match options.local_id {
            Some(id) => {
                let id = id.trim().to_string();
                require_non_empty(&id, "local id")?;
                id
            }
            None => generate_user_id(),
        };
        let mut key_store = KeyStore::new(local_id);
        if let Some(nickname) = options.nickname.as_deref() {
            key_store.set_local_identity(nickname)?;
        }

        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            key_store: Mutex::new(key_store),
            router: MessageRouter::new(options.ignore_own_echo),
            transport,
            joins: Mutex::new(HashMap::new()),
            inbound_tx,
            inbound_rx,
        })
    }

    pub fn current_identity(&self) -> Identity {
        lock(&self.key_store).identity().clone()
    }

    fn local_id(&self) -> String {
        lock(&self.key_store).identity().id.clone()
    }

    pub fn set_nickname(&self, nickname: &str) -> Result<Identity> {
        let identity = lock(&self.key_store).set_local_identity(nickname)?;
        self.notify(TransportRequest::IdentitySet {
            nickname: identity.nickname.clone(),
        });
        Ok(identity)
    }

    /// Replace the generated local id. Only allowed before any conversation
    /// has been joined, since direct conversation ids depend on it.
    /// A join whose request failed does not count.
    pub fn set_local_id(&self, id: &str) -> Result<Identity> {
        let joins = lock(&self.joins);
        if joins.values().any(join_counts) {
            return Err(Error::InvalidState(
                "local id cannot change after joining a conversation".to_string(),
            ));
        }
        lock(&self.key_store).set_local_id(id)
    }

    pub fn set_local_key_pair(&self, private_key: &[u8], public_key: &[u8]) -> Result<()> {
        lock(&self.key_store).set_local_key_pair(private_key, public_key)?;
        self.notify(TransportRequest::KeyPairSet {
            private_key: private_key.to_vec(),
            public_key: public_key.to_vec(),
        });
        Ok(())
    }

    pub fn add_friend(&self, peer_id: &str, public_key: &[u8]) -> Result<()> {
        lock(&self.key_store).add_friend_key(peer_id, public_key)?;
        self.notify(TransportRequest::FriendKeyAdded {
            peer_id: peer_id.to_string(),
            public_key: public_key.to_vec(),
        });
        Ok(())
    }

    pub fn add_group(&self, group_id: &str, symmetric_key: &[u8]) -> Result<()> {
        lock(&self.key_store).add_group_key(group_id, symmetric_key)?;
        self.notify(TransportRequest::GroupKeyAdded {
            group_id: group_id.to_string(),
            symmetric_key: symmetric_key.to_vec(),
        });
        Ok(())
    }

    pub fn friend_key(&self, peer_id: &str) -> Option<FriendKey> {
        lock(&self.key_store).get_friend_key(peer_id)
    }

    pub fn group_key(&self, group_id: &str) -> Option<GroupKey> {
        lock(&self.key_store).get_group_key(group_id)
    }

    pub fn friend_ids(&self) -> Vec<String> {
        lock(&self.key_store).friend_ids()
    }

    pub fn group_ids(&self) -> Vec<String> {
        lock(&self.key_store).group_ids()
    }

    /// Direct conversation id between us and `peer_id`.
    pub fn conversation_id(&self, peer_id: &str) -> Result<ConversationId> {
        resolve_direct(&self.local_id(), peer_id)
    }

    /// Open a direct conversation with a known friend.
    ///
    /// The join request goes out once per conversation. Later calls return
    /// the existing session and the original request's handle, unless that
    /// request failed, in which case it is issued again.
    pub fn start_direct(&self, peer_id: &str) -> Result<(ChatSession, Pending)> {
        require_non_empty(peer_id, "peer id")?;
        let mut joins = lock(&self.joins);
        let local_id = {
            let key_store = lock(&self.key_store);
            if !key_store.has_friend(peer_id) {
                return Err(Error::UnknownPeer(peer_id.to_string()));
            }
            key_store.identity().id.clone()
        };
        let cid = resolve_direct(&local_id, peer_id)?;
        let session = self.router.ensure_session(
            &cid,
            &format!("{DIRECT_DISPLAY_PREFIX} {peer_id}"),
            ConversationTarget::direct(peer_id),
        )?;
        let pending = self.join_once(
            &mut joins,
            &cid,
            TransportRequest::DirectJoinRequested {
                peer_id: peer_id.to_string(),
            },
        );
        Ok((session, pending))
    }

    /// Join a group whose key has been added.
    pub fn join_group(&self, group_id: &str) -> Result<(ChatSession, Pending)> {
        let cid = resolve_group(group_id)?;
        let mut joins = lock(&self.joins);
        if !lock(&self.key_store).has_group(group_id) {
            return Err(Error::UnknownGroup(group_id.to_string()));
        }
        let short: String = group_id.chars().take(8).collect();
        let session = self.router.ensure_session(
            &cid,
            &format!("{GROUP_DISPLAY_PREFIX} {short}"),
            ConversationTarget::group(group_id),
        )?;
        let pending = self.join_once(
            &mut joins,
            &cid,
            TransportRequest::GroupJoinRequested {
                group_id: group_id.to_string(),
            },
        );
        Ok((session, pending))
    }

    fn join_once(
        &self,
        joins: &mut HashMap<ConversationId, Pending>,
        cid: &str,
        request: TransportRequest,
    ) -> Pending {
        if let Some(existing) = joins.get(cid) {
            match existing.try_result() {
                Some(Err(err)) => {
                    tracing::debug!(cid, error = %err, "previous join failed; retrying");
                }
                _ => return existing.clone(),
            }
        }
        tracing::debug!(cid, request = request.name(), "joining conversation");
        let pending = self.transport.request(request);
        joins.insert(cid.to_string(), pending.clone());
        pending
    }

    /// Hand a plaintext to the transport for the given conversation.
    pub fn send(&self, target: &ConversationTarget, plaintext: &str) -> Result<Pending> {
        if plaintext.is_empty() {
            return Err(Error::invalid("message must not be empty"));
        }
        let request = {
            let key_store = lock(&self.key_store);
            match target {
                ConversationTarget::Direct { peer_id } => {
                    require_non_empty(peer_id, "peer id")?;
                    if !key_store.has_friend(peer_id) {
                        return Err(Error::UnknownPeer(peer_id.clone()));
                    }
                    if !key_store.has_local_key_pair() {
                        return Err(Error::InvalidState("local keypair not set".to_string()));
                    }
                    resolve_direct(&key_store.identity().id, peer_id)?;
                    TransportRequest::DirectSendRequested {
                        peer_id: peer_id.clone(),
                        plaintext: plaintext.to_string(),
                    }
                }
                ConversationTarget::Group { group_id } => {
                    resolve_group(group_id)?;
                    if !key_store.has_group(group_id) {
                        return Err(Error::UnknownGroup(group_id.clone()));
                    }
                    TransportRequest::GroupSendRequested {
                        group_id: group_id.clone(),
                        plaintext: plaintext.to_string(),
                    }
                }
            }
        };
        Ok(self.transport.request(request))
    }

    /// Send to a conversation by id, using the target recorded on its session.
    pub fn send_to_session(&self, cid: &str, plaintext: &str) -> Result<Pending> {
        require_non_empty(cid, "conversation id")?;
        let session = self
            .router
            .session(cid)
            .ok_or_else(|| Error::invalid(format!("no session for conversation {cid}")))?;
        self.send(&session.target, plaintext)
    }

    pub fn subscribe(
        &self,
        on_session_updated: impl Fn(&ChatSession, &DecryptedMessageEvent) + Send + Sync + 'static,
        on_error: impl Fn(&ErrorNotice) + Send + Sync + 'static,
    ) -> Subscription {
        self.router.subscribe(on_session_updated, on_error)
    }

    pub fn subscribe_channel(&self) -> (Subscription, Receiver<CoreNotification>) {
        self.router.subscribe_channel()
    }

    /// Process one inbound event to completion, including subscriber fan-out.
    ///
    /// Called from a subscriber callback, the event is queued and `Ok(None)`
    /// is returned.
    pub fn handle_event(&self, event: InboundEvent) -> Result<Option<CoreNotification>> {
        if self.router.is_closed() {
            return Err(Error::Closed);
        }
        if self.router.is_delivering() {
            tracing::debug!("queueing event handed in during delivery");
            self.inbound_tx.send(event).map_err(|_| Error::Closed)?;
            return Ok(None);
        }
        let local_id = self.local_id();
        let echo_peer = match &event {
            InboundEvent::DecryptedMessage(message)
                if !message.is_group && message.sender_id == local_id =>
            {
                self.friend_for_conversation(&local_id, &message.conversation_id)
            }
            _ => None,
        };
        self.router
            .handle_with_peer(event, &local_id, echo_peer.as_deref())
    }

    /// The friend whose direct conversation with us is `cid`.
    fn friend_for_conversation(&self, local_id: &str, cid: &str) -> Option<String> {
        self.friend_ids()
            .into_iter()
            .find(|peer| resolve_direct(local_id, peer).is_ok_and(|derived| derived == cid))
    }

    pub fn inbound_sender(&self) -> InboundSender {
        InboundSender {
            tx: self.inbound_tx.clone(),
        }
    }

    /// Drain every queued inbound event. Returns how many were processed.
    /// Does nothing from inside a subscriber callback.
    pub fn process_pending(&self) -> Result<usize> {
        if self.router.is_delivering() {
            return Ok(0);
        }
        let mut processed = 0;
        while let Ok(event) = self.inbound_rx.try_recv() {
            self.handle_event(event)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Wait up to `timeout` for one queued event and process it.
    pub fn process_next(&self, timeout: Duration) -> Result<bool> {
        if self.router.is_delivering() {
            return Ok(false);
        }
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event)?;
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed),
        }
    }

    pub fn sessions(&self) -> Vec<ChatSession> {
        self.router.sessions()
    }

    pub fn session(&self, cid: &str) -> Option<ChatSession> {
        self.router.session(cid)
    }

    /// Explicitly forget a session. The conversation stays joined.
    pub fn remove_session(&self, cid: &str) -> Result<bool> {
        self.router.remove_session(cid)
    }

    pub fn subscriber_count(&self) -> usize {
        self.router.subscriber_count()
    }

    /// Drop all subscribers and stop accepting inbound events.
    pub fn shutdown(&self) {
        tracing::debug!("chat core shutting down");
        self.router.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.router.is_closed()
    }

    // Key and identity updates are fire-and-forget.
    fn notify(&self, request: TransportRequest) {
        let name = request.name();
        let pending = self.transport.request(request);
        tracing::trace!(request_id = pending.id(), request = name, "notified transport");
    }
}

/// In flight or acknowledged.
fn join_counts(pending: &Pending) -> bool {
    !matches!(pending.try_result(), Some(Err(_)))
}
