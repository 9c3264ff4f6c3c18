//! Application callbacks for security events.

use crate::error::BusError;
use tether_wire::Message;

/// Receives authentication outcomes and security violations.
///
/// The coordinator calls these from short non-async sections; an
/// implementation must not block. Every securing attempt reports through
/// [`authentication_complete`](SecurityListener::authentication_complete),
/// success and failure alike, so an application can gate traffic on the
/// outcome without polling peer state.
pub trait SecurityListener: Send + Sync {
    /// An authentication attempt with `peer` finished.
    ///
    /// `mechanism` is the mechanism that ran, or an empty string when the
    /// attempt ended before one was selected (for example, cached session
    /// keys or a missing GUID exchange).
    fn authentication_complete(&self, mechanism: &str, peer: &str, success: bool);

    /// A message triggered a security violation that was not recovered
    /// internally.
    fn security_violation(&self, status: &BusError, message: &Message);
}

/// Listener that ignores every event.
///
/// Installed by default until the application registers its own through
/// `setup_peer_authentication`.
#[derive(Debug, Default)]
pub struct NullListener;

impl SecurityListener for NullListener {
    fn authentication_complete(&self, _mechanism: &str, _peer: &str, _success: bool) {}

    fn security_violation(&self, _status: &BusError, _message: &Message) {}
}
