//! Two complete bus stacks wired back to back.
//!
//! Each side's [`MethodCaller`] dispatches straight into the other
//! side's [`SecurityCoordinator`], so every `org.tether.Bus.Peer`
//! exchange runs both halves of the real code with no transport
//! underneath. Calls flagged encrypted are genuinely marshalled, sealed
//! under the caller's session key, and opened by the remote coordinator
//! before dispatch, which keeps the key-agreement tests honest.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;

use tether_bus::auth::SharedSecretAuth;
use tether_bus::{
    BusConfig, BusContext, BusError, BusResult, KeyKind, MessageRouter, MethodCaller,
    SecurityCoordinator, SecurityListener, PEER_INTERFACE, PEER_OBJECT_PATH,
};
use tether_crypto::aead::AeadKey;
use tether_wire::{Message, MessageBuilder, MessageFlags, MessageType, Value};

/// Unique name side A is known by on side B.
pub const NAME_A: &str = ":1.1";
/// Unique name side B is known by on side A.
pub const NAME_B: &str = ":1.2";
/// Unique name a self-looped stack addresses itself by.
pub const NAME_LOOP: &str = ":1.9";

/// Records listener callbacks for later assertions.
#[derive(Default)]
pub struct RecordingListener {
    completions: Mutex<Vec<(String, String, bool)>>,
    violations: Mutex<Vec<String>>,
}

impl RecordingListener {
    /// `(mechanism, peer, success)` tuples recorded so far.
    pub fn completions(&self) -> Vec<(String, String, bool)> {
        self.completions.lock().unwrap().clone()
    }

    /// Rendered violation errors recorded so far.
    pub fn violations(&self) -> Vec<String> {
        self.violations.lock().unwrap().clone()
    }
}

impl SecurityListener for RecordingListener {
    fn authentication_complete(&self, mechanism: &str, peer: &str, success: bool) {
        self.completions
            .lock()
            .unwrap()
            .push((mechanism.to_string(), peer.to_string(), success));
    }

    fn security_violation(&self, status: &BusError, _message: &Message) {
        self.violations.lock().unwrap().push(status.to_string());
    }
}

/// Collects routed messages together with their sender names.
#[derive(Default)]
pub struct CollectRouter {
    delivered: Mutex<Vec<(Message, String)>>,
}

impl CollectRouter {
    /// Serials of the messages delivered so far, in arrival order.
    pub fn serials(&self) -> Vec<u32> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.serial())
            .collect()
    }

    /// Number of messages delivered so far.
    pub fn len(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    /// Whether nothing has been delivered yet.
    pub fn is_empty(&self) -> bool {
        self.delivered.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl MessageRouter for CollectRouter {
    async fn route(&self, message: Message, sender: &str) -> BusResult<()> {
        self.delivered
            .lock()
            .unwrap()
            .push((message, sender.to_string()));
        Ok(())
    }
}

/// A [`MethodCaller`] that dispatches into a wired remote coordinator.
///
/// The remote end is filled in after both coordinators exist, since each
/// caller needs the coordinator built around the other caller.
pub struct LoopbackCaller {
    sender_name: String,
    local: Arc<BusContext>,
    remote: OnceLock<(Arc<SecurityCoordinator>, Arc<BusContext>)>,
}

impl LoopbackCaller {
    /// Caller whose dispatches arrive at the remote side as `sender_name`.
    pub fn new(sender_name: &str, local: Arc<BusContext>) -> Self {
        Self {
            sender_name: sender_name.to_string(),
            local,
            remote: OnceLock::new(),
        }
    }

    /// Wire the remote end. Panics when wired twice.
    pub fn wire(&self, coordinator: Arc<SecurityCoordinator>, context: Arc<BusContext>) {
        assert!(
            self.remote.set((coordinator, context)).is_ok(),
            "loopback caller wired twice"
        );
    }
}

#[async_trait]
impl MethodCaller for LoopbackCaller {
    async fn call_method(
        &self,
        destination: &str,
        member: &str,
        args: Vec<Value>,
        flags: MessageFlags,
        _timeout: Duration,
    ) -> BusResult<Vec<Value>> {
        let Some((remote, remote_context)) = self.remote.get() else {
            return Err(BusError::channel("loopback caller not wired"));
        };

        if flags.is_encrypted() {
            // Marshal the call, seal it under our session key for the
            // destination, and reopen it on the remote side, so the
            // negotiated keys really trade bytes both ways.
            let mut sealed = MessageBuilder::new(MessageType::MethodCall)
                .serial(self.local.next_serial())
                .path(PEER_OBJECT_PATH)
                .interface(PEER_INTERFACE)
                .member(member)
                .destination(destination)
                .sender(&self.sender_name)
                .body(args)
                .build(self.local.compression())?;
            let state = self
                .local
                .peers()
                .lookup(destination)
                .ok_or(BusError::key_unavailable("no security state for destination"))?;
            let (key_blob, nonce_blob) = state.get_key_and_nonce(KeyKind::Session)?;
            let key = AeadKey::from_blob(&key_blob)?;
            sealed.encrypt_body(&key, nonce_blob.as_bytes())?;

            let mut inbound =
                Message::unmarshal(sealed.into_bytes(), remote_context.compression())?;
            remote.decrypt_inbound(&mut inbound, &self.sender_name)?;
            let opened = inbound.body_values()?;
            return remote
                .dispatch_peer_call(&self.sender_name, member, &opened)
                .await;
        }

        remote
            .dispatch_peer_call(&self.sender_name, member, &args)
            .await
    }
}

/// One side's stack plus its recording observers.
pub struct BusSide {
    /// Unique name the other side addresses this bus by.
    pub name: &'static str,
    /// The bus context backing this side.
    pub context: Arc<BusContext>,
    /// The coordinator under test.
    pub coordinator: Arc<SecurityCoordinator>,
    /// Listener capturing authentication outcomes and violations.
    pub listener: Arc<RecordingListener>,
    /// Router capturing anything delivered locally.
    pub router: Arc<CollectRouter>,
}

/// Two stacks, A and B, with A's calls landing on B and vice versa.
pub struct TwoBusFixture {
    /// The side that initiates in most scenarios.
    pub a: BusSide,
    /// The answering side.
    pub b: BusSide,
}

impl TwoBusFixture {
    /// Build both sides with default configs.
    pub fn new() -> BusResult<Self> {
        Self::with_configs(BusConfig::default(), BusConfig::default())
    }

    /// Build both sides with per-side configs.
    pub fn with_configs(config_a: BusConfig, config_b: BusConfig) -> BusResult<Self> {
        let context_a = Arc::new(BusContext::new(config_a)?);
        let context_b = Arc::new(BusContext::new(config_b)?);
        Ok(Self::with_contexts(context_a, context_b))
    }

    /// Build both sides around existing contexts, for scenarios that
    /// restart a bus over a persistent key store.
    pub fn with_contexts(context_a: Arc<BusContext>, context_b: Arc<BusContext>) -> Self {
        let caller_a = Arc::new(LoopbackCaller::new(NAME_A, context_a.clone()));
        let caller_b = Arc::new(LoopbackCaller::new(NAME_B, context_b.clone()));
        let router_a = Arc::new(CollectRouter::default());
        let router_b = Arc::new(CollectRouter::default());
        let coordinator_a =
            SecurityCoordinator::new(context_a.clone(), caller_a.clone(), router_a.clone());
        let coordinator_b =
            SecurityCoordinator::new(context_b.clone(), caller_b.clone(), router_b.clone());
        caller_a.wire(coordinator_b.clone(), context_b.clone());
        caller_b.wire(coordinator_a.clone(), context_a.clone());
        Self {
            a: BusSide {
                name: NAME_A,
                context: context_a,
                coordinator: coordinator_a,
                listener: Arc::new(RecordingListener::default()),
                router: router_a,
            },
            b: BusSide {
                name: NAME_B,
                context: context_b,
                coordinator: coordinator_b,
                listener: Arc::new(RecordingListener::default()),
                router: router_b,
            },
        }
    }

    /// Enable the given space-separated mechanisms on both sides,
    /// installing each side's recording listener.
    pub fn enable_security(&self, mechanisms: &str) -> BusResult<()> {
        self.a
            .coordinator
            .setup_peer_authentication(mechanisms, self.a.listener.clone())?;
        self.b
            .coordinator
            .setup_peer_authentication(mechanisms, self.b.listener.clone())
    }

    /// Register the shared-secret mechanism with a per-side secret.
    pub fn register_shared_secret(&self, secret_a: &[u8], secret_b: &[u8]) {
        register_psk(&self.a.context, secret_a);
        register_psk(&self.b.context, secret_b);
    }

    /// Secure the connection from side A to side B.
    pub async fn secure_a_to_b(&self) -> BusResult<()> {
        self.a.coordinator.secure_peer_connection(NAME_B, false).await
    }
}

fn register_psk(context: &Arc<BusContext>, secret: &[u8]) {
    let secret = secret.to_vec();
    context.registry().register(
        SharedSecretAuth::NAME,
        Box::new(move || Box::new(SharedSecretAuth::new(secret.clone()))),
    );
}

/// One stack looped back onto itself under [`NAME_LOOP`], for scenarios
/// where a connection turns out to reach the same process.
pub struct SelfLoopFixture {
    /// The single context.
    pub context: Arc<BusContext>,
    /// The coordinator, wired as its own remote.
    pub coordinator: Arc<SecurityCoordinator>,
    /// Listener capturing authentication outcomes and violations.
    pub listener: Arc<RecordingListener>,
    /// Router capturing anything delivered locally.
    pub router: Arc<CollectRouter>,
}

impl SelfLoopFixture {
    /// Build the looped stack with a default config.
    pub fn new() -> BusResult<Self> {
        let context = Arc::new(BusContext::new(BusConfig::default())?);
        let caller = Arc::new(LoopbackCaller::new(NAME_LOOP, context.clone()));
        let router = Arc::new(CollectRouter::default());
        let coordinator =
            SecurityCoordinator::new(context.clone(), caller.clone(), router.clone());
        caller.wire(coordinator.clone(), context.clone());
        Ok(Self {
            context,
            coordinator,
            listener: Arc::new(RecordingListener::default()),
            router,
        })
    }
}
