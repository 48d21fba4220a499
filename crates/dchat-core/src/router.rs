//! Inbound event classification and subscriber fan-out.
//!
//! Every inbound event is processed under one gate: registry mutation and
//! delivery to all subscribers finish before the next event starts.

use crate::utils::parse_timestamp_ms;
use crate::{
    ChatSession, ConversationTarget, CoreNotification, DecryptedMessageEvent, Error, ErrorKind,
    ErrorNotice, InboundEvent, Result, SessionRegistry,
};
use crossbeam_channel::{Receiver, Sender};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub type SessionUpdatedHandler = Box<dyn Fn(&ChatSession, &DecryptedMessageEvent) + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(&ErrorNotice) + Send + Sync>;

thread_local! {
    /// Gates whose fan-out is running on this thread, innermost last.
    static DELIVERING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn gate_key(gate: &Mutex<()>) -> usize {
    gate as *const Mutex<()> as usize
}

fn delivering(gate: &Mutex<()>) -> bool {
    let key = gate_key(gate);
    DELIVERING.with(|d| d.borrow().contains(&key))
}

/// Marks a gate as delivering on this thread until dropped.
struct DeliveryScope(usize);

impl DeliveryScope {
    fn enter(gate: &Mutex<()>) -> Self {
        let key = gate_key(gate);
        DELIVERING.with(|d| d.borrow_mut().push(key));
        DeliveryScope(key)
    }
}

impl Drop for DeliveryScope {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|key| *key == self.0) {
                d.remove(pos);
            }
        });
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Sink {
    Callbacks {
        on_session_updated: SessionUpdatedHandler,
        on_error: ErrorHandler,
    },
    Channel(Sender<CoreNotification>),
}

struct Subscriber {
    id: u64,
    active: AtomicBool,
    sink: Sink,
}

impl Subscriber {
    /// Returns false once the subscriber can no longer receive anything.
    fn deliver(&self, notification: &CoreNotification) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        match &self.sink {
            Sink::Callbacks {
                on_session_updated,
                on_error,
            } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| match notification {
                    CoreNotification::SessionUpdated { session, message } => {
                        on_session_updated(session, message)
                    }
                    CoreNotification::ErrorRaised(notice) => on_error(notice),
                }));
                if outcome.is_err() {
                    tracing::warn!(subscriber = self.id, "subscriber callback panicked");
                }
                true
            }
            Sink::Channel(tx) => tx.send(notification.clone()).is_ok(),
        }
    }
}

#[derive(Default)]
struct SubscriberList {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberList {
    fn remove(&self, id: u64) {
        lock(&self.subscribers).retain(|s| s.id != id);
    }
}

/// Handle returned by a subscription. Dropping it keeps the subscription alive;
/// call [`Subscription::unsubscribe`] to end it.
#[must_use = "dropping the handle leaves the subscription active"]
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    list: Weak<SubscriberList>,
    gate: Weak<Mutex<()>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.subscriber.id
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::SeqCst)
    }

    /// Stop notifications. Once this returns, the subscriber receives nothing
    /// more, including notifications for an event being processed right now.
    pub fn unsubscribe(self) {
        self.subscriber.active.store(false, Ordering::SeqCst);
        if let Some(list) = self.list.upgrade() {
            list.remove(self.subscriber.id);
        }
        // Called from inside a callback: this thread owns the gate already and
        // the flag above stops the remaining deliveries.
        if let Some(gate) = self.gate.upgrade() {
            if !delivering(&gate) {
                drop(lock(&gate));
            }
        }
    }
}

pub struct MessageRouter {
    registry: Mutex<SessionRegistry>,
    subscribers: Arc<SubscriberList>,
    gate: Arc<Mutex<()>>,
    ignore_own_echo: bool,
    closed: AtomicBool,
}

impl MessageRouter {
    pub fn new(ignore_own_echo: bool) -> Self {
        Self {
            registry: Mutex::new(SessionRegistry::new()),
            subscribers: Arc::new(SubscriberList::default()),
            gate: Arc::new(Mutex::new(())),
            ignore_own_echo,
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(
        &self,
        on_session_updated: impl Fn(&ChatSession, &DecryptedMessageEvent) + Send + Sync + 'static,
        on_error: impl Fn(&ErrorNotice) + Send + Sync + 'static,
    ) -> Subscription {
        self.add_subscriber(Sink::Callbacks {
            on_session_updated: Box::new(on_session_updated),
            on_error: Box::new(on_error),
        })
    }

    /// Subscribe with a channel instead of callbacks.
    pub fn subscribe_channel(&self) -> (Subscription, Receiver<CoreNotification>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (self.add_subscriber(Sink::Channel(tx)), rx)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers.subscribers).len()
    }

    fn add_subscriber(&self, sink: Sink) -> Subscription {
        let subscriber = Arc::new(Subscriber {
            id: self.subscribers.next_id.fetch_add(1, Ordering::SeqCst),
            active: AtomicBool::new(!self.is_closed()),
            sink,
        });
        if subscriber.active.load(Ordering::SeqCst) {
            lock(&self.subscribers.subscribers).push(subscriber.clone());
        }
        Subscription {
            subscriber,
            list: Arc::downgrade(&self.subscribers),
            gate: Arc::downgrade(&self.gate),
        }
    }

    /// Process one inbound event to completion.
    ///
    /// Returns the notification that was fanned out, or `None` when the event
    /// was dropped as our own echo.
    pub fn handle(&self, event: InboundEvent, local_id: &str) -> Result<Option<CoreNotification>> {
        self.handle_with_peer(event, local_id, None)
    }

    /// [`handle`](Self::handle), naming the other participant of a direct
    /// conversation for messages the local user sent. Without it such a
    /// message is only accepted for an existing session.
    pub fn handle_with_peer(
        &self,
        event: InboundEvent,
        local_id: &str,
        echo_peer: Option<&str>,
    ) -> Result<Option<CoreNotification>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        // The gate is held further up this thread's stack.
        if self.is_delivering() {
            return Err(Error::InvalidState(
                "inbound event handled from inside a subscriber callback".to_string(),
            ));
        }
        let _gate = lock(&self.gate);

        let notification = match event {
            InboundEvent::DecryptedMessage(message) => {
                if self.ignore_own_echo && !local_id.is_empty() && message.sender_id == local_id {
                    tracing::debug!(cid = %message.conversation_id, "dropping own echo");
                    return Ok(None);
                }
                match self.apply(&message, local_id, echo_peer) {
                    Ok(session) => {
                        tracing::debug!(
                            cid = %session.id,
                            sender = %message.sender_id,
                            "session updated"
                        );
                        CoreNotification::SessionUpdated { session, message }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "rejecting inbound message");
                        CoreNotification::ErrorRaised(ErrorNotice {
                            kind: ErrorKind::MalformedEvent,
                            message: err.to_string(),
                            timestamp_iso: non_empty(&message.timestamp_iso),
                        })
                    }
                }
            }
            InboundEvent::TransportError {
                message,
                timestamp_iso,
            } => CoreNotification::ErrorRaised(ErrorNotice {
                kind: ErrorKind::Transport,
                message,
                timestamp_iso,
            }),
        };

        self.fan_out(&notification);
        Ok(Some(notification))
    }

    fn apply(
        &self,
        message: &DecryptedMessageEvent,
        local_id: &str,
        echo_peer: Option<&str>,
    ) -> Result<ChatSession> {
        validate(message)?;
        let mut registry = lock(&self.registry);
        let applied = if !message.is_group && message.sender_id == local_id {
            let target = match (echo_peer, registry.get(&message.conversation_id)) {
                (Some(peer), _) => ConversationTarget::direct(peer),
                (None, Some(existing)) => existing.target,
                (None, None) => {
                    return Err(Error::MalformedEvent(format!(
                        "own message for unknown direct conversation {}",
                        message.conversation_id
                    )))
                }
            };
            registry.apply_message_as(message, target)
        } else {
            registry.apply_message(message)
        };
        applied.map_err(|err| match err {
                Error::MalformedEvent(reason) | Error::InvalidInput(reason) => {
                    Error::MalformedEvent(reason)
                }
                other => other,
            })
    }

    fn fan_out(&self, notification: &CoreNotification) {
        let snapshot: Vec<Arc<Subscriber>> = lock(&self.subscribers.subscribers).clone();
        let _scope = DeliveryScope::enter(&self.gate);
        for subscriber in snapshot {
            if !subscriber.deliver(notification) && subscriber.active.swap(false, Ordering::SeqCst)
            {
                tracing::debug!(subscriber = subscriber.id, "channel subscriber went away");
                self.subscribers.remove(subscriber.id);
            }
        }
    }

    pub fn ensure_session(
        &self,
        cid: &str,
        display_name: &str,
        target: ConversationTarget,
    ) -> Result<ChatSession> {
        lock(&self.registry).ensure_session(cid, display_name, target)
    }

    pub fn session(&self, cid: &str) -> Option<ChatSession> {
        lock(&self.registry).get(cid)
    }

    pub fn has_session(&self, cid: &str) -> bool {
        lock(&self.registry).contains(cid)
    }

    pub fn sessions(&self) -> Vec<ChatSession> {
        lock(&self.registry).list()
    }

    pub fn remove_session(&self, cid: &str) -> Result<bool> {
        lock(&self.registry).remove(cid)
    }

    /// Drop every subscriber and refuse further events.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _gate = (!self.is_delivering()).then(|| lock(&self.gate));
        for subscriber in lock(&self.subscribers.subscribers).drain(..) {
            subscriber.active.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True when called from one of this router's subscriber callbacks.
    pub fn is_delivering(&self) -> bool {
        delivering(&self.gate)
    }
}

fn validate(message: &DecryptedMessageEvent) -> Result<()> {
    if message.conversation_id.is_empty() {
        return Err(Error::MalformedEvent("conversation id is empty".to_string()));
    }
    if message.sender_id.is_empty() {
        return Err(Error::MalformedEvent("sender id is empty".to_string()));
    }
    parse_timestamp_ms(&message.timestamp_iso)?;
    Ok(())
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn message(cid: &str, sender: &str, ts: &str, text: &str) -> InboundEvent {
        InboundEvent::DecryptedMessage(DecryptedMessageEvent {
            conversation_id: cid.to_string(),
            sender_id: sender.to_string(),
            timestamp_iso: ts.to_string(),
            plaintext: text.to_string(),
            is_group: true,
            subject: format!("dchat.grp.{cid}.msg"),
        })
    }

    #[test]
    fn fans_out_to_every_subscriber() {
        let router = MessageRouter::new(true);
        let (_a, rx_a) = router.subscribe_channel();
        let (_b, rx_b) = router.subscribe_channel();

        router
            .handle(message("g1", "bob", "2024-01-01T00:00:01Z", "hi"), "alice")
            .unwrap();

        for rx in [&rx_a, &rx_b] {
            match rx.try_recv().unwrap() {
                CoreNotification::SessionUpdated { session, message } => {
                    assert_eq!(session.id, "g1");
                    assert_eq!(message.plaintext, "hi");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn malformed_event_goes_to_error_channel_only() {
        let router = MessageRouter::new(true);
        let (_sub, rx) = router.subscribe_channel();

        let out = router
            .handle(message("g1", "", "2024-01-01T00:00:01Z", "hi"), "alice")
            .unwrap();

        assert!(router.sessions().is_empty());
        match out {
            Some(CoreNotification::ErrorRaised(notice)) => {
                assert_eq!(notice.kind, ErrorKind::MalformedEvent);
                assert!(notice.message.contains("sender id"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok(CoreNotification::ErrorRaised(_))));
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let router = MessageRouter::new(true);
        let out = router
            .handle(message("g1", "bob", "soon", "hi"), "alice")
            .unwrap();
        assert!(matches!(
            out,
            Some(CoreNotification::ErrorRaised(ErrorNotice {
                kind: ErrorKind::MalformedEvent,
                ..
            }))
        ));
        assert!(router.sessions().is_empty());
    }

    #[test]
    fn transport_errors_pass_through_unchanged() {
        let router = MessageRouter::new(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = router.subscribe(
            |_, _| {},
            move |notice| sink.lock().unwrap().push(notice.clone()),
        );

        router
            .handle(
                InboundEvent::TransportError {
                    message: "decrypt: cipher: message authentication failed".to_string(),
                    timestamp_iso: Some("2024-01-01T00:00:00Z".to_string()),
                },
                "alice",
            )
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, ErrorKind::Transport);
        assert_eq!(
            seen[0].message,
            "decrypt: cipher: message authentication failed"
        );
    }

    #[test]
    fn own_echo_is_dropped_when_enabled() {
        let router = MessageRouter::new(true);
        let out = router
            .handle(message("g1", "alice", "2024-01-01T00:00:01Z", "mine"), "alice")
            .unwrap();
        assert!(out.is_none());
        assert!(router.sessions().is_empty());

        let keeping = MessageRouter::new(false);
        assert!(keeping
            .handle(message("g1", "alice", "2024-01-01T00:00:01Z", "mine"), "alice")
            .unwrap()
            .is_some());
        assert_eq!(keeping.sessions().len(), 1);
    }

    #[test]
    fn kept_direct_echo_never_targets_self() {
        let router = MessageRouter::new(false);
        let echo = |cid: &str| {
            InboundEvent::DecryptedMessage(DecryptedMessageEvent {
                conversation_id: cid.to_string(),
                sender_id: "alice".to_string(),
                timestamp_iso: "2024-01-01T00:00:01Z".to_string(),
                plaintext: "mine".to_string(),
                is_group: false,
                subject: String::new(),
            })
        };

        let out = router.handle(echo("d1"), "alice").unwrap();
        assert!(matches!(out, Some(CoreNotification::ErrorRaised(_))));
        assert!(!router.has_session("d1"));

        router
            .ensure_session("d1", "Direct bob", ConversationTarget::direct("bob"))
            .unwrap();
        router.handle(echo("d1"), "alice").unwrap();
        assert_eq!(
            router.session("d1").unwrap().target,
            ConversationTarget::direct("bob")
        );

        router
            .handle_with_peer(echo("d2"), "alice", Some("carol"))
            .unwrap();
        assert_eq!(
            router.session("d2").unwrap().target,
            ConversationTarget::direct("carol")
        );
    }

    #[test]
    fn unsubscribed_handler_receives_nothing_more() {
        let router = MessageRouter::new(true);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = router.subscribe(
            move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );

        router
            .handle(message("g1", "bob", "2024-01-01T00:00:01Z", "one"), "alice")
            .unwrap();
        sub.unsubscribe();
        router
            .handle(message("g1", "bob", "2024-01-01T00:00:02Z", "two"), "alice")
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_from_inside_callback_stops_later_deliveries() {
        let router = Arc::new(MessageRouter::new(true));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let slot_in = slot.clone();
        let c = count.clone();
        let sub = router.subscribe(
            move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot_in.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            },
            |_| {},
        );
        *slot.lock().unwrap() = Some(sub);

        router
            .handle(message("g1", "bob", "2024-01-01T00:00:01Z", "one"), "alice")
            .unwrap();
        router
            .handle(message("g1", "bob", "2024-01-01T00:00:02Z", "two"), "alice")
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_from_inside_callback_is_rejected_not_deadlocked() {
        let router = Arc::new(MessageRouter::new(true));
        let other = Arc::new(MessageRouter::new(true));
        let results = Arc::new(Mutex::new(Vec::new()));

        let (inner, other_in, seen) = (Arc::downgrade(&router), other.clone(), results.clone());
        let _sub = router.subscribe(
            |_, _| {},
            move |_| {
                let Some(router) = inner.upgrade() else { return };
                let same = router.handle(message("g1", "bob", "2024-01-01T00:00:01Z", "x"), "alice");
                let unrelated =
                    other_in.handle(message("g2", "bob", "2024-01-01T00:00:01Z", "y"), "alice");
                seen.lock().unwrap().push((same, unrelated.is_ok()));
            },
        );

        router
            .handle(
                InboundEvent::TransportError {
                    message: "link down".to_string(),
                    timestamp_iso: None,
                },
                "alice",
            )
            .unwrap();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].0, Err(Error::InvalidState(_))));
        assert!(results[0].1);
        assert!(!router.is_delivering());
        assert!(other.has_session("g2"));
        assert!(!router.has_session("g1"));
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let router = MessageRouter::new(true);
        let _bad = router.subscribe(|_, _| panic!("boom"), |_| {});
        let (_good, rx) = router.subscribe_channel();

        router
            .handle(message("g1", "bob", "2024-01-01T00:00:01Z", "one"), "alice")
            .unwrap();
        router
            .handle(message("g1", "bob", "2024-01-01T00:00:02Z", "two"), "alice")
            .unwrap();

        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn dropped_channel_receiver_is_pruned() {
        let router = MessageRouter::new(true);
        let (sub, rx) = router.subscribe_channel();
        drop(rx);
        router
            .handle(message("g1", "bob", "2024-01-01T00:00:01Z", "one"), "alice")
            .unwrap();
        assert!(!sub.is_active());
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn closed_router_rejects_events_and_subscribers() {
        let router = MessageRouter::new(true);
        let (sub, _rx) = router.subscribe_channel();
        router.close();
        assert!(!sub.is_active());
        assert_eq!(
            router.handle(message("g1", "bob", "2024-01-01T00:00:01Z", "x"), "alice"),
            Err(Error::Closed)
        );
        let (late, _rx) = router.subscribe_channel();
        assert!(!late.is_active());
        assert_eq!(router.subscriber_count(), 0);
    }
}
