//! Conversation id derivation.
//!
//! Both sides of a direct chat compute the same id from their two user ids,
//! so no negotiation round-trip is needed to land in one session.

use crate::utils::require_non_empty;
use crate::{
    ConversationId, ConversationTarget, Error, Result, DIRECT_CID_HEX_LEN, DIRECT_CID_SEPARATOR,
};
use sha2::{Digest, Sha256};

/// Direct conversation id: first 16 hex chars of `sha256("<lo>:<hi>")`.
pub fn resolve_direct(local_id: &str, peer_id: &str) -> Result<ConversationId> {
    require_non_empty(local_id, "local id")?;
    require_non_empty(peer_id, "peer id")?;
    if local_id == peer_id {
        return Err(Error::invalid("cannot open a conversation with yourself"));
    }

    let (lo, hi) = if local_id < peer_id {
        (local_id, peer_id)
    } else {
        (peer_id, local_id)
    };

    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update([DIRECT_CID_SEPARATOR as u8]);
    hasher.update(hi.as_bytes());
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..DIRECT_CID_HEX_LEN].to_string())
}

pub fn resolve_group(group_id: &str) -> Result<ConversationId> {
    require_non_empty(group_id, "group id")?;
    Ok(group_id.to_string())
}

pub fn resolve(local_id: &str, target: &ConversationTarget) -> Result<ConversationId> {
    match target {
        ConversationTarget::Direct { peer_id } => resolve_direct(local_id, peer_id),
        ConversationTarget::Group { group_id } => resolve_group(group_id),
    }
}
