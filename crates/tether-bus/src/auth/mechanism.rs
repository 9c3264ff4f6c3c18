//! Pluggable authentication mechanism interface.
//!
//! A mechanism is a small state machine producing and consuming opaque
//! payloads; the conversation layer wraps those payloads in the line
//! protocol and never inspects them. A successful run ends with a master
//! secret both sides derived independently, tagged with the mechanism's
//! name.

use crate::error::BusResult;
use tether_crypto::keyblob::KeyBlob;

/// Which side of an authentication conversation this party plays.
///
/// The responder initiates the exchange and drives it with method
/// calls; the challenger answers from the method handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    /// Answers `AuthChallenge` calls.
    Challenger,
    /// Initiates and drives the conversation.
    Responder,
}

/// Outcome of one mechanism step.
#[derive(Debug)]
pub enum AuthStep {
    /// Send this payload and wait for the peer's next round.
    Continue(Vec<u8>),
    /// Authentication succeeded. A responder's final step may carry one
    /// last payload for the challenger; a challenger's carries none.
    Complete(Vec<u8>),
    /// Authentication failed; the conversation reports auth-fail.
    Fail,
}

/// One concrete authentication method.
///
/// The conversation calls exactly one side's methods per instance:
/// [`initial_response`](AuthMechanism::initial_response) then
/// [`response`](AuthMechanism::response) on the responder,
/// [`challenge`](AuthMechanism::challenge) on the challenger. A step
/// called out of order returns [`AuthStep::Fail`].
pub trait AuthMechanism: Send + Sync {
    /// Registered mechanism name, carried on the `AUTH` line.
    fn name(&self) -> &'static str;

    /// Whether the mechanism involves an operator (and so may be retried
    /// on failure). Non-interactive mechanisms are never retried
    /// automatically.
    fn is_interactive(&self) -> bool {
        false
    }

    /// The responder's opening payload, sent inside `AUTH`.
    ///
    /// # Errors
    ///
    /// Returns an error when key or nonce generation fails.
    fn initial_response(&mut self) -> BusResult<AuthStep>;

    /// Consume a challenge payload, produce the next response.
    ///
    /// # Errors
    ///
    /// Returns an error when key or nonce generation fails; protocol
    /// violations surface as [`AuthStep::Fail`] instead.
    fn response(&mut self, challenge: &[u8]) -> BusResult<AuthStep>;

    /// Consume a response payload, produce the next challenge.
    ///
    /// # Errors
    ///
    /// Returns an error when key or nonce generation fails; protocol
    /// violations surface as [`AuthStep::Fail`] instead.
    fn challenge(&mut self, response: &[u8]) -> BusResult<AuthStep>;

    /// The negotiated master secret, tagged with the mechanism name.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::KeyUnavailable`](crate::BusError::KeyUnavailable)
    /// before the mechanism reaches [`AuthStep::Complete`].
    fn master_secret(&self) -> BusResult<KeyBlob>;
}
