//! Session and key-routing core of an end-to-end encrypted chat client.
//!
//! The core sits between "a message has just been decrypted" and "the user
//! sees an up-to-date list of conversations". Encryption, delivery, and
//! persistence belong to a transport collaborator reached through
//! [`ChatTransport`].

pub mod chat_core;
pub mod conversation;
pub mod error;
pub mod key_store;
pub mod router;
pub mod session_registry;
pub mod transport;
pub mod types;
pub mod utils;

pub use chat_core::{ChatCore, InboundSender};
pub use conversation::{resolve, resolve_direct, resolve_group};
pub use error::{Error, Result};
pub use key_store::{KeyStore, LocalKeyPair};
pub use router::{ErrorHandler, MessageRouter, SessionUpdatedHandler, Subscription};
pub use session_registry::SessionRegistry;
pub use transport::{
    Acknowledger, ChannelTransport, ChatTransport, OutboundRequest, Pending, TransportRequest,
};
pub use types::*;
