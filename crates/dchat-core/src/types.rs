use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Canonical conversation identifier (direct CID or group id).
pub type ConversationId = String;

/// Number of hex characters kept from the SHA-256 digest of a direct conversation.
pub const DIRECT_CID_HEX_LEN: usize = 16;
/// Separator placed between the two ordered participant ids before hashing.
pub const DIRECT_CID_SEPARATOR: char = ':';
/// Prefix of generated local user ids.
pub const USER_ID_PREFIX: &str = "user_";

pub const GROUP_DISPLAY_PREFIX: &str = "Group";
pub const DIRECT_DISPLAY_PREFIX: &str = "Direct";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub nickname: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendKey {
    pub peer_id: String,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKey {
    pub group_id: String,
    #[serde(with = "hex::serde")]
    pub symmetric_key: Vec<u8>,
}

// Key bytes stay out of logs.
impl fmt::Debug for FriendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FriendKey")
            .field("peer_id", &self.peer_id)
            .field("public_key", &format_args!("<{} bytes>", self.public_key.len()))
            .finish()
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupKey")
            .field("group_id", &self.group_id)
            .field("symmetric_key", &format_args!("<{} bytes>", self.symmetric_key.len()))
            .finish()
    }
}

/// Who a conversation is with. Resolved once into a [`ConversationId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConversationTarget {
    #[serde(rename_all = "camelCase")]
    Direct { peer_id: String },
    #[serde(rename_all = "camelCase")]
    Group { group_id: String },
}

impl ConversationTarget {
    pub fn direct(peer_id: impl Into<String>) -> Self {
        ConversationTarget::Direct {
            peer_id: peer_id.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        ConversationTarget::Group {
            group_id: group_id.into(),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ConversationTarget::Group { .. })
    }

    /// Peer id or group id, depending on the variant.
    pub fn remote_id(&self) -> &str {
        match self {
            ConversationTarget::Direct { peer_id } => peer_id,
            ConversationTarget::Group { group_id } => group_id,
        }
    }
}

/// A message the transport collaborator has already decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedMessageEvent {
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub timestamp_iso: String,
    pub plaintext: String,
    pub is_group: bool,
    /// Transport routing metadata, never interpreted here.
    #[serde(default)]
    pub subject: String,
}

/// Serialized with a derived `isGroup` field next to `target`; `isGroup` is
/// ignored when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: ConversationId,
    pub display_name: String,
    pub target: ConversationTarget,
    pub last_message: Option<String>,
    pub last_time_epoch_ms: Option<i64>,
}

impl ChatSession {
    pub fn new(id: ConversationId, display_name: String, target: ConversationTarget) -> Self {
        Self {
            id,
            display_name,
            target,
            last_message: None,
            last_time_epoch_ms: None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.target.is_group()
    }
}

impl Serialize for ChatSession {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ChatSession", 6)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("displayName", &self.display_name)?;
        state.serialize_field("isGroup", &self.is_group())?;
        state.serialize_field("target", &self.target)?;
        state.serialize_field("lastMessage", &self.last_message)?;
        state.serialize_field("lastTimeEpochMs", &self.last_time_epoch_ms)?;
        state.end()
    }
}

/// Events pushed into the core by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundEvent {
    DecryptedMessage(DecryptedMessageEvent),
    #[serde(rename_all = "camelCase")]
    TransportError {
        message: String,
        #[serde(default)]
        timestamp_iso: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Failure reported by the transport collaborator, passed through unchanged.
    Transport,
    /// Inbound message that failed structural validation.
    MalformedEvent,
}

/// Payload of an `errorRaised` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp_iso: Option<String>,
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Normalized notification fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoreNotification {
    SessionUpdated {
        session: ChatSession,
        message: DecryptedMessageEvent,
    },
    ErrorRaised(ErrorNotice),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatCoreOptions {
    /// Local user id. Generated when absent.
    pub local_id: Option<String>,
    pub nickname: Option<String>,
    /// Drop decrypted messages whose sender is the local user.
    pub ignore_own_echo: bool,
}

impl Default for ChatCoreOptions {
    fn default() -> Self {
        Self {
            local_id: None,
            nickname: None,
            ignore_own_echo: true,
        }
    }
}
