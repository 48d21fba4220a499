use crate::utils::{parse_timestamp_ms, require_non_empty};
use crate::{
    ChatSession, ConversationId, ConversationTarget, DecryptedMessageEvent, Result,
    DIRECT_DISPLAY_PREFIX, GROUP_DISPLAY_PREFIX,
};
use std::collections::HashMap;

struct Entry {
    seq: u64,
    session: ChatSession,
}

/// One [`ChatSession`] per conversation id, listed in creation order.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConversationId, Entry>,
    next_seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `cid`, creating it if needed.
    ///
    /// Display name and target only apply on creation.
    pub fn ensure_session(
        &mut self,
        cid: &str,
        display_name: &str,
        target: ConversationTarget,
    ) -> Result<ChatSession> {
        require_non_empty(cid, "conversation id")?;
        Ok(self
            .ensure_entry(cid, || display_name.to_string(), target)
            .clone())
    }

    /// Record a delivered message against its conversation.
    ///
    /// Summary fields move only forward in message time; an older message is
    /// still delivered but leaves `last_message` untouched.
    ///
    /// A new direct session is attributed to the sender.
    pub fn apply_message(&mut self, event: &DecryptedMessageEvent) -> Result<ChatSession> {
        let target = if event.is_group {
            ConversationTarget::group(event.conversation_id.clone())
        } else {
            ConversationTarget::direct(event.sender_id.clone())
        };
        self.apply_message_as(event, target)
    }

    /// [`apply_message`](Self::apply_message) with the target a new session
    /// gets, for messages whose sender is not the remote participant.
    pub fn apply_message_as(
        &mut self,
        event: &DecryptedMessageEvent,
        target: ConversationTarget,
    ) -> Result<ChatSession> {
        require_non_empty(&event.conversation_id, "conversation id")?;
        let time_ms = parse_timestamp_ms(&event.timestamp_iso)?;

        let display_name = default_display_name(&event.conversation_id, &target);
        let session = self.ensure_entry(&event.conversation_id, || display_name, target);

        if session.is_group() != event.is_group {
            tracing::warn!(
                cid = %session.id,
                session_is_group = session.is_group(),
                event_is_group = event.is_group,
                "message kind disagrees with existing session; keeping session kind"
            );
        }

        let newer = session
            .last_time_epoch_ms
            .map_or(true, |current| time_ms >= current);
        if newer {
            session.last_message = Some(event.plaintext.clone());
            session.last_time_epoch_ms = Some(time_ms);
        } else {
            tracing::debug!(
                cid = %session.id,
                time_ms,
                "older message leaves session summary unchanged"
            );
        }

        Ok(session.clone())
    }

    pub fn get(&self, cid: &str) -> Option<ChatSession> {
        self.sessions.get(cid).map(|entry| entry.session.clone())
    }

    pub fn contains(&self, cid: &str) -> bool {
        self.sessions.contains_key(cid)
    }

    pub fn list(&self) -> Vec<ChatSession> {
        let mut entries: Vec<&Entry> = self.sessions.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.session.clone()).collect()
    }

    pub fn remove(&mut self, cid: &str) -> Result<bool> {
        require_non_empty(cid, "conversation id")?;
        Ok(self.sessions.remove(cid).is_some())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn ensure_entry(
        &mut self,
        cid: &str,
        display_name: impl FnOnce() -> String,
        target: ConversationTarget,
    ) -> &mut ChatSession {
        let next_seq = &mut self.next_seq;
        &mut self
            .sessions
            .entry(cid.to_string())
            .or_insert_with(|| {
                let seq = *next_seq;
                *next_seq += 1;
                tracing::debug!(cid, "session created");
                Entry {
                    seq,
                    session: ChatSession::new(cid.to_string(), display_name(), target),
                }
            })
            .session
    }
}

fn default_display_name(cid: &str, target: &ConversationTarget) -> String {
    match target {
        ConversationTarget::Group { .. } => {
            let short: String = cid.chars().take(8).collect();
            format!("{GROUP_DISPLAY_PREFIX} {short}")
        }
        ConversationTarget::Direct { peer_id } => format!("{DIRECT_DISPLAY_PREFIX} {peer_id}"),
    }
}
