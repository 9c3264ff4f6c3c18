//! Error types for the bus peering core.
//!
//! Errors are categorized to support retry decisions in the delivery
//! pipeline and the security coordinator:
//!
//! - **Transient**: may succeed on retry (timeouts, full queues, a closing
//!   endpoint racing a send)
//! - **Permanent**: will not succeed without intervention (unknown
//!   mechanism, failed authentication, missing key material)
//!
//! Codec and cryptography failures from the lower crates arrive through
//! the [`WireError`] and [`CryptoError`] wrappers and keep their own
//! variant detail.

use std::borrow::Cow;
use tether_crypto::CryptoError;
use tether_wire::WireError;
use thiserror::Error;

/// Errors that can occur in bus peering operations.
#[derive(Debug, Error)]
pub enum BusError {
    // ============ Security Errors ============
    /// No authentication mechanism has been registered or negotiated
    #[error("no authentication mechanism available")]
    NoAuthMechanism,

    /// A peer's GUID is required but has never been exchanged
    #[error("peer GUID unknown: {0}")]
    NoPeerGuid(Cow<'static, str>),

    /// A requested authentication mechanism name is not registered
    #[error("invalid authentication mechanism: {0}")]
    InvalidMechanism(Cow<'static, str>),

    /// An authentication conversation ended in failure
    #[error("authentication failed: {0}")]
    AuthFailed(Cow<'static, str>),

    /// An inbound message body could not be decrypted
    #[error("message decryption failed: {0}")]
    DecryptionFailed(Cow<'static, str>),

    /// Key material for a peer is missing or invalid
    #[error("key unavailable: {0}")]
    KeyUnavailable(Cow<'static, str>),

    /// A reliable message failed the anti-replay serial check
    #[error("invalid message serial: {0}")]
    InvalidSerial(u32),

    // ============ Resource Errors ============
    /// A bounded queue rejected a submission
    #[error("queue exhausted: {0}")]
    QueueExhausted(Cow<'static, str>),

    /// Persisting the key store failed
    #[error("key store write failed: {0}")]
    WriteError(Cow<'static, str>),

    // ============ Flow Control Errors ============
    /// The endpoint is shutting down; returned to every blocked sender
    #[error("endpoint is closing")]
    EndpointClosing,

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    // ============ Dispatch Errors ============
    /// A header expansion was fetched but still does not resolve the token
    #[error("header expansion invalid")]
    ExpansionInvalid,

    /// A message carries OS handles but the stream cannot pass them
    #[error("stream does not support handle passing")]
    HandlesNotSupported,

    /// A peer method call named an unknown member
    #[error("no such method: {0}")]
    UnknownMethod(Cow<'static, str>),

    /// A method reply did not carry the expected argument shape
    #[error("malformed method reply: {0}")]
    BadReply(Cow<'static, str>),

    /// An inbound method call carried a malformed argument
    #[error("bad method argument: {0}")]
    BadArgument(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Invalid state for the requested operation
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// A channel send or receive failed
    #[error("channel error: {0}")]
    Channel(Cow<'static, str>),

    // ============ Layered Errors ============
    /// Wire codec failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl BusError {
    /// Returns true if this error is transient and may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Timeout(_)
                | BusError::QueueExhausted(_)
                | BusError::EndpointClosing
                | BusError::Channel(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on
    /// retry.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BusError::NoAuthMechanism
                | BusError::NoPeerGuid(_)
                | BusError::InvalidMechanism(_)
                | BusError::AuthFailed(_)
                | BusError::KeyUnavailable(_)
                | BusError::InvalidSerial(_)
                | BusError::ExpansionInvalid
                | BusError::HandlesNotSupported
                | BusError::UnknownMethod(_)
                | BusError::BadArgument(_)
                | BusError::InvalidState(_)
        )
    }

    /// Create a no-peer-guid error with static context (zero allocation)
    #[must_use]
    pub const fn no_peer_guid(context: &'static str) -> Self {
        BusError::NoPeerGuid(Cow::Borrowed(context))
    }

    /// Create an invalid-mechanism error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_mechanism(context: &'static str) -> Self {
        BusError::InvalidMechanism(Cow::Borrowed(context))
    }

    /// Create an auth-failed error with static context (zero allocation)
    #[must_use]
    pub const fn auth_failed(context: &'static str) -> Self {
        BusError::AuthFailed(Cow::Borrowed(context))
    }

    /// Create a decryption-failed error with static context (zero allocation)
    #[must_use]
    pub const fn decryption_failed(context: &'static str) -> Self {
        BusError::DecryptionFailed(Cow::Borrowed(context))
    }

    /// Create a key-unavailable error with static context (zero allocation)
    #[must_use]
    pub const fn key_unavailable(context: &'static str) -> Self {
        BusError::KeyUnavailable(Cow::Borrowed(context))
    }

    /// Create a queue-exhausted error with static context (zero allocation)
    #[must_use]
    pub const fn queue_exhausted(context: &'static str) -> Self {
        BusError::QueueExhausted(Cow::Borrowed(context))
    }

    /// Create a write error with static context (zero allocation)
    #[must_use]
    pub const fn write_error(context: &'static str) -> Self {
        BusError::WriteError(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        BusError::Timeout(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        BusError::InvalidState(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        BusError::Channel(Cow::Borrowed(context))
    }

    /// Create a bad-reply error with static context (zero allocation)
    #[must_use]
    pub const fn bad_reply(context: &'static str) -> Self {
        BusError::BadReply(Cow::Borrowed(context))
    }

    /// Create a bad-argument error with static context (zero allocation)
    #[must_use]
    pub const fn bad_argument(context: &'static str) -> Self {
        BusError::BadArgument(Cow::Borrowed(context))
    }
}

/// Result type for bus peering operations.
pub type BusResult<T> = Result<T, BusError>;
