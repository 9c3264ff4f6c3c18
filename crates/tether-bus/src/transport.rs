//! External boundaries of the peering core.
//!
//! Connection setup, name ownership, and message dispatch live outside
//! this crate. Three seams cover everything the pipeline and the
//! security coordinator need from them:
//!
//! - [`MessageStream`] — the byte-oriented duplex stream under one
//!   endpoint, with optional OS-handle passing
//! - [`MessageRouter`] — where validated inbound messages go
//! - [`MethodCaller`] — issues `org.tether.Bus.Peer` method calls to a
//!   named peer and returns the reply arguments

use crate::error::BusResult;
use async_trait::async_trait;
use std::time::Duration;
use tether_wire::{Message, MessageFlags, Value};

/// Opaque OS handle (file descriptor or equivalent) delivered alongside
/// a message on streams that negotiated handle passing.
pub type OsHandle = u64;

/// A connected byte-oriented duplex stream.
///
/// Implementations take `&self` so one receive task and one transmit
/// task can drive the same stream concurrently; the two directions must
/// not block each other.
#[async_trait]
pub trait MessageStream: Send + Sync {
    /// Read bytes until `buf` is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream closes or fails before `buf` is
    /// filled.
    async fn pull_bytes(&self, buf: &mut [u8]) -> BusResult<()>;

    /// Write all of `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream closes or fails before every byte
    /// is written.
    async fn push_bytes(&self, buf: &[u8]) -> BusResult<()>;

    /// Write all of `buf` with OS handles attached.
    ///
    /// # Errors
    ///
    /// The default implementation rejects every call with
    /// [`BusError::HandlesNotSupported`](crate::BusError::HandlesNotSupported);
    /// streams that negotiated handle passing override it.
    async fn push_bytes_with_handles(
        &self,
        buf: &[u8],
        handles: &[OsHandle],
    ) -> BusResult<()> {
        let _ = (buf, handles);
        Err(crate::BusError::HandlesNotSupported)
    }

    /// Whether this stream negotiated OS-handle passing.
    fn supports_handle_passing(&self) -> bool {
        false
    }
}

/// Routes one validated inbound message toward its consumer.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Deliver `message`, received from the connection owned by
    /// `sender`.
    ///
    /// # Errors
    ///
    /// Routing failures are logged by the caller and never tear down the
    /// connection.
    async fn route(&self, message: Message, sender: &str) -> BusResult<()>;
}

/// Issues a peer method call through the dispatch layer.
#[async_trait]
pub trait MethodCaller: Send + Sync {
    /// Call `member` on `org.tether.Bus.Peer` at `destination` and wait
    /// for the reply arguments.
    ///
    /// `flags` carries delivery options for the call message; an
    /// encrypted flag asks the dispatch layer to seal the call under the
    /// destination's session key.
    ///
    /// # Errors
    ///
    /// Returns the peer's error reply, or a timeout after `timeout`.
    async fn call_method(
        &self,
        destination: &str,
        member: &str,
        args: Vec<Value>,
        flags: MessageFlags,
        timeout: Duration,
    ) -> BusResult<Vec<Value>>;
}

/// Observes endpoint termination.
pub trait ExitListener: Send + Sync {
    /// Both pipeline loops of the endpoint named `name` have exited.
    fn endpoint_exit(&self, name: &str);
}
