//! Per-connection message pipeline.
//!
//! An [`Endpoint`] owns one connected peer's [`MessageStream`] and runs
//! two tasks over it: a receive loop that frames, validates, and routes
//! inbound messages, and a transmit loop that drains a bounded outbound
//! queue. Senders block when the queue is full; queued messages whose
//! time to live ran out are evicted to make room first, and a blocked
//! sender never waits longer than the configured cap before rechecking.
//!
//! Inbound validation order matters: the remote timestamp moves into the
//! local clock domain first, then the serial passes the anti-replay
//! check, then compressed headers are expanded (off-task), and only then
//! can expiry and decryption be judged.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_crypto::aead::AeadKey;
use tether_wire::message::wall_clock_ms;
use tether_wire::{Message, ENVELOPE_SIZE};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use crate::context::BusContext;
use crate::coordinator::{SecurityCoordinator, BUS_NAME};
use crate::error::{BusError, BusResult};
use crate::peer_state::KeyKind;
use crate::transport::{ExitListener, MessageRouter, MessageStream, OsHandle};

/// One queued outbound message with any attached OS handles.
struct TxItem {
    message: Message,
    handles: Vec<OsHandle>,
}

struct TxShared {
    queue: VecDeque<TxItem>,
    closing: bool,
}

/// The message pipeline for one connected peer.
pub struct Endpoint {
    name: String,
    stream: Arc<dyn MessageStream>,
    context: Arc<BusContext>,
    coordinator: Arc<SecurityCoordinator>,
    router: Arc<dyn MessageRouter>,
    exit_listener: Option<Arc<dyn ExitListener>>,
    tx: Mutex<TxShared>,
    /// Signalled when a message lands in the transmit queue.
    tx_ready: Notify,
    /// Signalled when the transmit queue frees a slot.
    tx_space: Notify,
    shutdown: watch::Sender<bool>,
    live_loops: AtomicUsize,
}

impl Endpoint {
    /// Wire up an endpoint over `stream` for the peer named `name`.
    ///
    /// Nothing runs until [`start`](Self::start).
    pub fn new(
        name: impl Into<String>,
        stream: Arc<dyn MessageStream>,
        context: Arc<BusContext>,
        coordinator: Arc<SecurityCoordinator>,
        router: Arc<dyn MessageRouter>,
        exit_listener: Option<Arc<dyn ExitListener>>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            stream,
            context,
            coordinator,
            router,
            exit_listener,
            tx: Mutex::new(TxShared {
                queue: VecDeque::new(),
                closing: false,
            }),
            tx_ready: Notify::new(),
            tx_space: Notify::new(),
            shutdown,
            live_loops: AtomicUsize::new(0),
        })
    }

    /// The unique name of the peer this endpoint serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the receive and transmit loops.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidState`] if the loops are already
    /// running.
    pub fn start(self: &Arc<Self>) -> BusResult<()> {
        if self
            .live_loops
            .compare_exchange(0, 2, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BusError::invalid_state("endpoint already started"));
        }
        let rx = Arc::clone(self);
        tokio::spawn(async move {
            rx.receive_loop().await;
            rx.loop_exited();
        });
        let tx = Arc::clone(self);
        tokio::spawn(async move {
            tx.transmit_loop().await;
            tx.loop_exited();
        });
        debug!(name = %self.name, "endpoint started");
        Ok(())
    }

    /// Begin shutdown: both loops stop, and every sender blocked on the
    /// transmit queue fails with [`BusError::EndpointClosing`]. Queued
    /// but untransmitted messages are dropped.
    pub fn stop(&self) {
        let already = {
            let mut tx = self.tx.lock().unwrap();
            std::mem::replace(&mut tx.closing, true)
        };
        if !already {
            debug!(name = %self.name, "stopping endpoint");
        }
        self.shutdown.send_replace(true);
        self.tx_space.notify_waiters();
        self.tx_ready.notify_waiters();
    }

    fn loop_exited(&self) {
        if self.live_loops.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!(name = %self.name, "endpoint exited");
            if let Some(listener) = &self.exit_listener {
                listener.endpoint_exit(&self.name);
            }
        }
    }

    // ============ Transmit side ============

    /// Queue `message` for transmission in order.
    ///
    /// Blocks while the queue is full, evicting expired queued messages
    /// to make room.
    ///
    /// # Errors
    ///
    /// [`BusError::EndpointClosing`] once [`stop`](Self::stop) ran.
    pub async fn send(&self, message: Message) -> BusResult<()> {
        self.enqueue_tx(message, Vec::new()).await
    }

    /// Queue `message` with OS handles attached.
    ///
    /// # Errors
    ///
    /// [`BusError::HandlesNotSupported`] when `handles` is non-empty on
    /// a stream that never negotiated handle passing, otherwise as
    /// [`send`](Self::send).
    pub async fn send_with_handles(
        &self,
        message: Message,
        handles: Vec<OsHandle>,
    ) -> BusResult<()> {
        if !handles.is_empty() && !self.stream.supports_handle_passing() {
            return Err(BusError::HandlesNotSupported);
        }
        self.enqueue_tx(message, handles).await
    }

    /// Seal `message` for this peer and queue it for transmission.
    ///
    /// Broadcast signals seal under the process group key; everything
    /// else under the session key negotiated with this peer.
    ///
    /// # Errors
    ///
    /// [`BusError::KeyUnavailable`] when no key has been negotiated,
    /// sealing failures from the cipher, otherwise as
    /// [`send`](Self::send).
    pub async fn send_secure(&self, mut message: Message) -> BusResult<()> {
        self.seal_outbound(&mut message)?;
        self.enqueue_tx(message, Vec::new()).await
    }

    fn seal_outbound(&self, message: &mut Message) -> BusResult<()> {
        let (key_blob, nonce_blob) = if message.is_broadcast() {
            self.context.peers().group_key_and_nonce()?
        } else {
            let state = self
                .context
                .peers()
                .lookup(&self.name)
                .ok_or(BusError::key_unavailable("peer has no security state"))?;
            state.get_key_and_nonce(KeyKind::Session)?
        };
        let key = AeadKey::from_blob(&key_blob)?;
        message.encrypt_body(&key, nonce_blob.as_bytes())?;
        trace!(name = %self.name, serial = message.serial(), "sealed outbound message");
        Ok(())
    }

    async fn enqueue_tx(&self, message: Message, handles: Vec<OsHandle>) -> BusResult<()> {
        let depth = self.context.config().tx_queue_depth;
        let cap = self.context.config().tx_wait_cap;
        let item = TxItem { message, handles };
        loop {
            let notified = self.tx_space.notified();
            tokio::pin!(notified);
            let wait = {
                let mut tx = self.tx.lock().unwrap();
                if tx.closing {
                    return Err(BusError::EndpointClosing);
                }
                if tx.queue.len() >= depth {
                    let now = wall_clock_ms();
                    let before = tx.queue.len();
                    tx.queue.retain(|queued| !queued.message.has_expired(now));
                    let evicted = before - tx.queue.len();
                    if evicted > 0 {
                        debug!(name = %self.name, evicted, "evicted expired messages from transmit queue");
                        if evicted > 1 {
                            self.tx_space.notify_waiters();
                        }
                    }
                }
                if tx.queue.len() < depth {
                    tx.queue.push_back(item);
                    self.tx_ready.notify_one();
                    return Ok(());
                }
                // Wait no longer than the soonest queued expiry, so the
                // eviction pass above gets a chance to free a slot.
                let now = wall_clock_ms();
                notified.as_mut().enable();
                tx.queue
                    .iter()
                    .filter_map(|queued| queued.message.expires_in(now))
                    .min()
                    .map_or(cap, |ms| cap.min(Duration::from_millis(u64::from(ms))))
            };
            trace!(name = %self.name, "transmit queue full, waiting for space");
            let _ = tokio::time::timeout(wait, notified.as_mut()).await;
        }
    }

    async fn transmit_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let item = {
                let mut tx = self.tx.lock().unwrap();
                if tx.closing {
                    break;
                }
                tx.queue.pop_front()
            };
            match item {
                Some(item) => {
                    self.tx_space.notify_one();
                    let pushed = tokio::select! {
                        result = self.transmit(item) => result,
                        _ = shutdown.changed() => break,
                    };
                    if let Err(err) = pushed {
                        warn!(name = %self.name, error = %err, "transmit failed");
                        self.stop();
                        break;
                    }
                }
                None => {
                    let notified = self.tx_ready.notified();
                    tokio::pin!(notified);
                    {
                        let tx = self.tx.lock().unwrap();
                        if tx.closing {
                            break;
                        }
                        if !tx.queue.is_empty() {
                            continue;
                        }
                        notified.as_mut().enable();
                    }
                    tokio::select! {
                        () = notified => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        trace!(name = %self.name, "transmit loop exiting");
    }

    async fn transmit(&self, item: TxItem) -> BusResult<()> {
        if item.message.has_expired(wall_clock_ms()) {
            trace!(name = %self.name, serial = item.message.serial(), "expired in transmit queue");
            return Ok(());
        }
        trace!(name = %self.name, serial = item.message.serial(), "transmitting");
        if item.handles.is_empty() {
            self.stream.push_bytes(item.message.bytes()).await
        } else {
            self.stream
                .push_bytes_with_handles(item.message.bytes(), &item.handles)
                .await
        }
    }

    // ============ Receive side ============

    async fn receive_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let pulled = tokio::select! {
                result = self.read_message() => result,
                _ = shutdown.changed() => break,
            };
            let message = match pulled {
                Ok(message) => message,
                Err(err) => {
                    debug!(name = %self.name, error = %err, "receive loop ending");
                    break;
                }
            };
            if let Err(err) = self.accept_inbound(message).await {
                warn!(name = %self.name, error = %err, "closing connection on fatal inbound message");
                break;
            }
        }
        // Tear the transmit side down with us.
        self.stop();
        trace!(name = %self.name, "receive loop exiting");
    }

    async fn read_message(&self) -> BusResult<Message> {
        let mut envelope = [0u8; ENVELOPE_SIZE];
        self.stream.pull_bytes(&mut envelope).await?;
        let total = Message::required_len(&envelope)?;
        let mut buf = vec![0u8; total];
        buf[..ENVELOPE_SIZE].copy_from_slice(&envelope);
        self.stream.pull_bytes(&mut buf[ENVELOPE_SIZE..]).await?;
        Ok(Message::unmarshal(buf, self.context.compression())?)
    }

    /// Validate one inbound message and hand it on.
    ///
    /// `Ok` means the loop continues, whether the message was routed or
    /// dropped. An error is fatal for the connection.
    async fn accept_inbound(&self, mut message: Message) -> BusResult<()> {
        let state = self.context.peers().get_peer_state(&self.name, None);

        // Rewrite the remote timestamp into the local clock domain
        // before any expiry math sees it.
        if let Some(remote_ts) = message.fields().timestamp() {
            message.set_timestamp(state.estimate_timestamp(remote_ts));
        }

        let serial = message.serial();
        let secure = message.is_encrypted();
        let unreliable = message.is_unreliable();
        if !state.is_valid_serial(serial, secure, unreliable) {
            if unreliable || message.is_broadcast() || is_control(&message) {
                trace!(name = %self.name, serial, "dropped message with rejected serial");
                return Ok(());
            }
            return Err(BusError::InvalidSerial(serial));
        }

        if message.needs_expansion().is_some() {
            trace!(name = %self.name, serial, "deferring message for header expansion");
            if let Err(err) = self.coordinator.queue_header_expansion(message, &self.name) {
                warn!(name = %self.name, serial, error = %err, "could not defer message for expansion");
            }
            return Ok(());
        }

        if message.has_expired(wall_clock_ms()) {
            trace!(name = %self.name, serial, "inbound message expired");
            return Ok(());
        }

        if message.is_encrypted() {
            if let Err(err) = self.coordinator.decrypt_inbound(&mut message, &self.name) {
                self.coordinator
                    .handle_security_violation(&message, &err, &self.name);
                return Ok(());
            }
        }

        if let Err(err) = self.router.route(message, &self.name).await {
            debug!(name = %self.name, error = %err, "router refused message");
        }
        Ok(())
    }
}

/// Bus control traffic is sent by or addressed to the bus itself and is
/// never fatal on a replay, only dropped.
fn is_control(message: &Message) -> bool {
    let fields = message.fields();
    fields.destination() == Some(BUS_NAME) || fields.sender() == Some(BUS_NAME)
}
