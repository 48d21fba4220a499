use crate::utils::require_non_empty;
use crate::{Error, FriendKey, GroupKey, Identity, Result};
use std::collections::HashMap;

/// Local keypair. Opaque bytes handed to the transport collaborator.
#[derive(Clone)]
pub struct LocalKeyPair {
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// Validated key-value store for the local identity, friends and groups.
///
/// No cryptographic checks happen here; only empty material is rejected.
/// Adding a key for an id that already has one replaces it.
pub struct KeyStore {
    identity: Identity,
    key_pair: Option<LocalKeyPair>,
    friend_keys: HashMap<String, FriendKey>,
    group_keys: HashMap<String, GroupKey>,
}

impl KeyStore {
    pub fn new(local_id: String) -> Self {
        Self {
            identity: Identity {
                id: local_id,
                nickname: String::new(),
            },
            key_pair: None,
            friend_keys: HashMap::new(),
            group_keys: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn set_local_identity(&mut self, nickname: &str) -> Result<Identity> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(Error::invalid("nickname must not be empty"));
        }
        self.identity.nickname = nickname.to_string();
        Ok(self.identity.clone())
    }

    pub fn set_local_id(&mut self, id: &str) -> Result<Identity> {
        let id = id.trim();
        require_non_empty(id, "local id")?;
        self.identity.id = id.to_string();
        Ok(self.identity.clone())
    }

    pub fn set_local_key_pair(&mut self, private_key: &[u8], public_key: &[u8]) -> Result<()> {
        if private_key.is_empty() || public_key.is_empty() {
            return Err(Error::invalid("local keypair must not be empty"));
        }
        self.key_pair = Some(LocalKeyPair {
            private_key: private_key.to_vec(),
            public_key: public_key.to_vec(),
        });
        Ok(())
    }

    pub fn local_key_pair(&self) -> Option<&LocalKeyPair> {
        self.key_pair.as_ref()
    }

    pub fn has_local_key_pair(&self) -> bool {
        self.key_pair.is_some()
    }

    pub fn add_friend_key(&mut self, peer_id: &str, public_key: &[u8]) -> Result<()> {
        require_non_empty(peer_id, "peer id")?;
        if public_key.is_empty() {
            return Err(Error::invalid(format!("public key for {peer_id} is empty")));
        }
        self.friend_keys.insert(
            peer_id.to_string(),
            FriendKey {
                peer_id: peer_id.to_string(),
                public_key: public_key.to_vec(),
            },
        );
        Ok(())
    }

    pub fn add_group_key(&mut self, group_id: &str, symmetric_key: &[u8]) -> Result<()> {
        require_non_empty(group_id, "group id")?;
        if symmetric_key.is_empty() {
            return Err(Error::invalid(format!("symmetric key for {group_id} is empty")));
        }
        self.group_keys.insert(
            group_id.to_string(),
            GroupKey {
                group_id: group_id.to_string(),
                symmetric_key: symmetric_key.to_vec(),
            },
        );
        Ok(())
    }

    pub fn get_friend_key(&self, peer_id: &str) -> Option<FriendKey> {
        self.friend_keys.get(peer_id).cloned()
    }

    pub fn get_group_key(&self, group_id: &str) -> Option<GroupKey> {
        self.group_keys.get(group_id).cloned()
    }

    pub fn has_friend(&self, peer_id: &str) -> bool {
        self.friend_keys.contains_key(peer_id)
    }

    pub fn has_group(&self, group_id: &str) -> bool {
        self.group_keys.contains_key(group_id)
    }

    /// Known friend ids, sorted.
    pub fn friend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.friend_keys.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Known group ids, sorted.
    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.group_keys.keys().cloned().collect();
        ids.sort();
        ids
    }
}
