//! # TETHER Bus
//!
//! Trust establishment and secure message delivery between connected
//! peers of a TETHER bus.
//!
//! The crate sits between the [`tether_wire`] codec and the dispatch
//! layer of a bus daemon. It covers:
//! - Per-peer security state: exchanged GUIDs, session and group keys,
//!   the anti-replay serial window, and clock-offset tracking
//!   ([`peer_state`])
//! - Line-oriented authentication conversations with pluggable
//!   mechanisms ([`auth`])
//! - The [`SecurityCoordinator`]: both sides of the
//!   `org.tether.Bus.Peer` interface, driving GUID exchange, session-key
//!   agreement, full authentication, and group-key exchange, plus
//!   header-expansion recovery and security-violation handling
//! - The per-connection [`Endpoint`] pipeline: a receive loop that
//!   frames, validates, expands and decrypts inbound messages, and a
//!   transmit loop draining a bounded queue that evicts expired messages
//!   under pressure
//!
//! ## Securing a connection
//!
//! ```text
//! initiator                                   responder
//!     │ ExchangeGuids(guid, version)              │
//!     │──────────────────────────────────────────>│
//!     │ AuthChallenge(line)   (no cached master)  │
//!     │<─────────────────────────────────────────>│
//!     │ GenSessionKey(guids, nonce)               │
//!     │──────────────────────────────────────────>│
//!     │ ExchangeGroupKeys(key || nonce)  [sealed] │
//!     │──────────────────────────────────────────>│
//! ```
//!
//! The authentication conversation runs only when no master secret for
//! the peer's GUID is cached; a cached secret goes straight to the
//! one-round-trip `GenSessionKey` exchange and falls back to the full
//! conversation once if the peer rejects it.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod auth;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod peer_state;
pub mod transport;

pub use config::BusConfig;
pub use context::{BusContext, KeyStoreSink};
pub use coordinator::{SecurityCoordinator, BUS_NAME, PEER_INTERFACE, PEER_OBJECT_PATH};
pub use endpoint::Endpoint;
pub use error::{BusError, BusResult};
pub use listener::{NullListener, SecurityListener};
pub use peer_state::{KeyKind, PeerState, PeerStateTable};
pub use transport::{ExitListener, MessageRouter, MessageStream, MethodCaller, OsHandle};
