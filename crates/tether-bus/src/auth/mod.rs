//! Pluggable peer authentication.
//!
//! A mechanism ([`AuthMechanism`]) turns challenge/response payloads
//! into a shared master secret; a conversation ([`AuthConversation`])
//! drives one mechanism per peer over the `AUTH`/`DATA`/`OK` line
//! protocol, falling back across mechanisms on `REJECTED`. The
//! [`AuthRegistry`] maps mechanism names to constructors so transports
//! and applications can install their own.
//!
//! Two mechanisms ship in-tree: an ephemeral X25519 key agreement
//! ([`EcdhKeyExchange`]) and a pre-shared secret proof
//! ([`SharedSecretAuth`]).

mod conversation;
mod ecdh;
mod mechanism;
mod psk;
mod registry;

pub use conversation::{AuthConversation, ConversationState};
pub use ecdh::EcdhKeyExchange;
pub use mechanism::{AuthMechanism, AuthRole, AuthStep};
pub use psk::SharedSecretAuth;
pub use registry::{AuthRegistry, MechanismCtor};
