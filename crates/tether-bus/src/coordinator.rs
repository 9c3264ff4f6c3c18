//! Peer security coordinator.
//!
//! Owns both halves of the `org.tether.Bus.Peer` exchanges: the client
//! side ([`secure_peer_connection`](SecurityCoordinator::secure_peer_connection))
//! drives GUID exchange, session-key negotiation, authentication
//! conversations, and group-key exchange against a remote peer; the
//! responder side ([`dispatch_peer_call`](SecurityCoordinator::dispatch_peer_call))
//! answers those same calls when a remote initiates. Work that must not
//! block a receive loop (inbound auth challenges, header-expansion
//! fetches, opportunistic re-securing) goes through a bounded deferred
//! queue drained by one supervisor task.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tether_crypto::aead::{self, AeadKey};
use tether_crypto::{prf, random, Guid, KeyBlob, KeyBlobKind};
use tether_wire::message::wall_clock_ms;
use tether_wire::{HeaderFields, Message, MessageFlags, Value, WireError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::auth::{AuthConversation, ConversationState};
use crate::context::BusContext;
use crate::error::{BusError, BusResult};
use crate::listener::SecurityListener;
use crate::peer_state::{KeyKind, PeerState};
use crate::transport::{MessageRouter, MethodCaller};

/// Reserved name carried by bus control traffic.
pub const BUS_NAME: &str = "org.tether.Bus";
/// Interface the peer security methods live on.
pub const PEER_INTERFACE: &str = "org.tether.Bus.Peer";
/// Object path of the peer security object.
pub const PEER_OBJECT_PATH: &str = "/org/tether/Bus/Peer";

/// `ExchangeGuids(s guid, u version) -> (s, u)`
pub const METHOD_EXCHANGE_GUIDS: &str = "ExchangeGuids";
/// `GenSessionKey(s initiator_guid, s target_guid, s nonce) -> (s, s)`
pub const METHOD_GEN_SESSION_KEY: &str = "GenSessionKey";
/// `ExchangeGroupKeys(ay key_and_nonce) -> (ay)`
pub const METHOD_EXCHANGE_GROUP_KEYS: &str = "ExchangeGroupKeys";
/// `AuthChallenge(s line) -> (s)`
pub const METHOD_AUTH_CHALLENGE: &str = "AuthChallenge";
/// `GetExpansion(u token) -> (a(yv))`
pub const METHOD_GET_EXPANSION: &str = "GetExpansion";

/// Version tag exchanged alongside GUIDs.
const PEER_AUTH_VERSION: u32 = 1;
/// Length of the nonce each side contributes to session key derivation.
const SESSION_NONCE_LEN: usize = 28;
/// Group key exchange payload: AEAD key followed by base nonce.
const GROUP_KEY_PAYLOAD_LEN: usize = aead::KEY_SIZE + aead::NONCE_SIZE;
/// Tag on keys a process assigns when securing a connection to itself.
const SELF_MECHANISM: &str = "SELF";

/// Work queued for the deferred supervisor.
enum DeferredTask {
    SecurePeer {
        peer: String,
        force_reauth: bool,
    },
    RequestExpansion {
        message: Message,
        sender: String,
    },
    AuthChallenge {
        sender: String,
        line: String,
        reply: oneshot::Sender<BusResult<String>>,
    },
}

/// Trust establishment and inbound security handling for one bus.
///
/// One coordinator serves every connection of the process. Challenger
/// conversations are keyed by the remote's name and only ever advanced
/// on the supervisor task, so each ordered peer pair has at most one
/// live conversation.
pub struct SecurityCoordinator {
    context: Arc<BusContext>,
    caller: Arc<dyn MethodCaller>,
    router: Arc<dyn MessageRouter>,
    conversations: DashMap<String, AuthConversation>,
    deferred: mpsc::Sender<DeferredTask>,
}

impl SecurityCoordinator {
    /// Build the coordinator and spawn its deferred supervisor.
    ///
    /// The supervisor holds only a weak reference; it drains the queue
    /// until the last strong reference drops, then exits.
    pub fn new(
        context: Arc<BusContext>,
        caller: Arc<dyn MethodCaller>,
        router: Arc<dyn MessageRouter>,
    ) -> Arc<Self> {
        let (deferred, tasks) = mpsc::channel(context.config().deferred_queue_depth);
        let coordinator = Arc::new(Self {
            context,
            caller,
            router,
            conversations: DashMap::new(),
            deferred,
        });
        tokio::spawn(Self::supervise(Arc::downgrade(&coordinator), tasks));
        coordinator
    }

    async fn supervise(weak: Weak<Self>, mut tasks: mpsc::Receiver<DeferredTask>) {
        while let Some(task) = tasks.recv().await {
            let Some(coordinator) = weak.upgrade() else {
                break;
            };
            coordinator.run_deferred(task).await;
        }
        trace!("deferred supervisor exiting");
    }

    async fn run_deferred(&self, task: DeferredTask) {
        match task {
            DeferredTask::SecurePeer { peer, force_reauth } => {
                if let Err(err) = self.secure_peer_connection(&peer, force_reauth).await {
                    debug!(peer = %peer, error = %err, "deferred securing failed");
                }
            }
            DeferredTask::RequestExpansion { message, sender } => {
                if let Err(err) = self.request_header_expansion(message, &sender).await {
                    warn!(sender = %sender, error = %err, "header expansion failed");
                }
            }
            DeferredTask::AuthChallenge {
                sender,
                line,
                reply,
            } => {
                let outcome = self.handle_auth_challenge(&sender, &line);
                let _ = reply.send(outcome);
            }
        }
    }

    fn enqueue(&self, task: DeferredTask) -> BusResult<()> {
        self.deferred.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                BusError::queue_exhausted("deferred security queue is full")
            }
            mpsc::error::TrySendError::Closed(_) => {
                BusError::channel("deferred supervisor is gone")
            }
        })
    }

    /// Enable peer security with the given space-separated mechanism
    /// names and install the listener. An empty name list disables
    /// security while keeping the listener.
    ///
    /// # Errors
    ///
    /// [`BusError::InvalidMechanism`] when a name is not registered.
    pub fn setup_peer_authentication(
        &self,
        mechanisms: &str,
        listener: Arc<dyn SecurityListener>,
    ) -> BusResult<()> {
        if mechanisms.trim().is_empty() {
            debug!("peer security disabled");
            self.context.set_auth_mechanisms(Vec::new());
            self.context.set_listener(listener);
            return Ok(());
        }
        let names = self.context.registry().check_names(mechanisms)?;
        debug!(mechanisms = ?names, "peer security enabled");
        self.context.set_auth_mechanisms(names);
        self.context.set_listener(listener);
        Ok(())
    }

    // ============ Client side ============

    /// Establish session and group keys with `peer`.
    ///
    /// Idempotent: an already-secure peer returns immediately unless
    /// `force_reauth`, which clears its keys and renegotiates. The
    /// listener's `authentication_complete` fires for every attempt that
    /// reaches the exchange, success and failure alike.
    ///
    /// # Errors
    ///
    /// [`BusError::NoAuthMechanism`] when security was never enabled,
    /// [`BusError::AuthFailed`] and friends when negotiation fails, and
    /// transport errors from the underlying method calls.
    pub async fn secure_peer_connection(&self, peer: &str, force_reauth: bool) -> BusResult<()> {
        if !self.context.security_enabled() {
            return Err(BusError::NoAuthMechanism);
        }
        let state = self.context.peers().get_peer_state(peer, None);
        if state.is_secure() && !force_reauth {
            trace!(peer = %peer, "peer already secure");
            return Ok(());
        }
        if force_reauth {
            debug!(peer = %peer, "forcing reauthentication");
            state.clear_keys();
        }

        let listener = self.context.listener();
        let remote_guid = match self.exchange_guids(peer).await {
            Ok(guid) => guid,
            Err(err) => {
                listener.authentication_complete("", peer, false);
                return Err(err);
            }
        };
        state.set_guid(remote_guid);

        // One client-initiated securing exchange at a time, process-wide.
        let _securing = self.context.securing_lock().lock().await;

        // The peer may have been dropped or secured while we waited.
        let state = self.context.peers().get_peer_state(peer, None);
        state.set_guid(remote_guid);
        if state.is_secure() && !force_reauth {
            debug!(peer = %peer, "peer secured while waiting for the lock");
            return Ok(());
        }

        if remote_guid == self.context.local_guid() {
            let outcome = self.secure_self(&state);
            listener.authentication_complete("", peer, outcome.is_ok());
            return outcome;
        }

        let (mechanism, outcome) = self.negotiate_session(peer, &state, remote_guid).await;
        if outcome.is_err() {
            state.clear_keys();
        }
        listener.authentication_complete(&mechanism, peer, outcome.is_ok());
        outcome
    }

    /// Run the two-pass key establishment loop, then the group-key
    /// exchange. Returns the mechanism that produced the master secret
    /// alongside the result.
    async fn negotiate_session(
        &self,
        peer: &str,
        state: &Arc<PeerState>,
        remote_guid: Guid,
    ) -> (String, BusResult<()>) {
        let mut mechanism = String::new();
        let result = async {
            for attempt in 0..2 {
                if self.context.key_store().has_key(&remote_guid)? {
                    match self.establish_session_key(peer, state, remote_guid).await {
                        Ok(used) => {
                            mechanism = used;
                            return self.exchange_group_keys(peer, state).await;
                        }
                        Err(err) => {
                            if attempt > 0 {
                                return Err(err);
                            }
                            debug!(peer = %peer, error = %err, "cached master secret rejected");
                            if let Err(gone) = self.context.key_store().del_key(&remote_guid) {
                                trace!(error = %gone, "stale master secret already gone");
                            }
                        }
                    }
                }
                if attempt > 0 {
                    break;
                }
                let (master, used) = self.run_full_authentication(peer, remote_guid).await?;
                mechanism = used;
                self.context.key_store().add_key(remote_guid, master)?;
                self.context.persist_key_store()?;
            }
            Err(BusError::auth_failed(
                "session key derivation failed after authentication",
            ))
        }
        .await;
        (mechanism, result)
    }

    async fn exchange_guids(&self, peer: &str) -> BusResult<Guid> {
        let args = vec![
            Value::String(self.context.local_guid().to_string()),
            Value::Uint32(PEER_AUTH_VERSION),
        ];
        let reply = self
            .caller
            .call_method(
                peer,
                METHOD_EXCHANGE_GUIDS,
                args,
                MessageFlags::new(),
                self.context.config().call_timeout,
            )
            .await?;
        let guid_str = reply
            .first()
            .and_then(Value::as_str)
            .ok_or(BusError::bad_reply("ExchangeGuids reply missing GUID"))?;
        let version = reply
            .get(1)
            .and_then(Value::as_u32)
            .ok_or(BusError::bad_reply("ExchangeGuids reply missing version"))?;
        let guid: Guid = guid_str
            .parse()
            .map_err(|_| BusError::bad_reply("ExchangeGuids reply GUID malformed"))?;
        if guid.is_empty() {
            return Err(BusError::no_peer_guid("peer reported an empty GUID"));
        }
        trace!(peer = %peer, guid = %guid.short(), version, "exchanged GUIDs");
        Ok(guid)
    }

    /// Cheap path: derive a session key from an existing master secret
    /// through one `GenSessionKey` round trip. Returns the mechanism tag
    /// carried on the master secret.
    async fn establish_session_key(
        &self,
        peer: &str,
        state: &Arc<PeerState>,
        remote_guid: Guid,
    ) -> BusResult<String> {
        let master = self.context.key_store().get_key(&remote_guid)?;
        let mut local_nonce = [0u8; SESSION_NONCE_LEN];
        random::fill_random(&mut local_nonce)?;
        let local_nonce_hex = hex::encode(local_nonce);

        let args = vec![
            Value::String(self.context.local_guid().to_string()),
            Value::String(remote_guid.to_string()),
            Value::String(local_nonce_hex.clone()),
        ];
        let reply = self
            .caller
            .call_method(
                peer,
                METHOD_GEN_SESSION_KEY,
                args,
                MessageFlags::new(),
                self.context.config().call_timeout,
            )
            .await?;
        let remote_nonce_hex = reply
            .first()
            .and_then(Value::as_str)
            .ok_or(BusError::bad_reply("GenSessionKey reply missing nonce"))?;
        let their_verifier = reply
            .get(1)
            .and_then(Value::as_str)
            .ok_or(BusError::bad_reply("GenSessionKey reply missing verifier"))?;
        if hex::decode(remote_nonce_hex).map(|n| n.len()) != Ok(SESSION_NONCE_LEN) {
            return Err(BusError::bad_reply("GenSessionKey reply nonce malformed"));
        }

        // Both sides seed with initiator nonce first, verbatim hex.
        let seed = format!("{local_nonce_hex}{remote_nonce_hex}");
        let prf::SessionMatter {
            key,
            nonce,
            verifier,
        } = prf::derive_session_matter(&master, seed.as_bytes())?;
        if !prf::verifiers_match(&verifier, their_verifier) {
            return Err(BusError::auth_failed("session key verifier mismatch"));
        }
        state.set_key_and_nonce(KeyKind::Session, key, nonce);
        state.set_auth_mechanism(master.tag());
        debug!(peer = %peer, mechanism = master.tag(), "session key established");
        Ok(master.tag().to_string())
    }

    /// Slow path: run a full authentication conversation as responder,
    /// under the authentication timeout. Returns the negotiated master
    /// secret and the mechanism that produced it.
    async fn run_full_authentication(
        &self,
        peer: &str,
        expected_guid: Guid,
    ) -> BusResult<(KeyBlob, String)> {
        let limit = self.context.config().auth_timeout;
        match tokio::time::timeout(limit, self.drive_conversation(peer, expected_guid)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::timeout("authentication conversation timed out")),
        }
    }

    async fn drive_conversation(
        &self,
        peer: &str,
        expected_guid: Guid,
    ) -> BusResult<(KeyBlob, String)> {
        let mut conversation = AuthConversation::new_responder(
            self.context.registry().clone(),
            self.context.auth_mechanisms(),
            self.context.local_guid(),
        );
        let mut line = conversation.start()?;
        loop {
            let reply = self
                .caller
                .call_method(
                    peer,
                    METHOD_AUTH_CHALLENGE,
                    vec![Value::String(line)],
                    MessageFlags::new(),
                    self.context.config().call_timeout,
                )
                .await?;
            let Some(reply_line) = reply.first().and_then(Value::as_str) else {
                return Err(BusError::bad_reply("AuthChallenge reply missing line"));
            };
            match conversation.advance(reply_line)? {
                Some(next) => line = next,
                None => break,
            }
        }
        if conversation.state() != ConversationState::Success {
            return Err(BusError::auth_failed("authentication conversation failed"));
        }
        if conversation.remote_guid() != Some(expected_guid) {
            return Err(BusError::auth_failed("peer GUID changed during authentication"));
        }
        let master = conversation.master_secret()?;
        Ok((master, conversation.mechanism_name().to_string()))
    }

    /// Send our group key under the fresh session key and store the
    /// peer's in return.
    async fn exchange_group_keys(&self, peer: &str, state: &Arc<PeerState>) -> BusResult<()> {
        let (group_key, group_nonce) = self.context.peers().group_key_and_nonce()?;
        let mut payload = Vec::with_capacity(GROUP_KEY_PAYLOAD_LEN);
        payload.extend_from_slice(group_key.as_bytes());
        payload.extend_from_slice(group_nonce.as_bytes());

        let reply = self
            .caller
            .call_method(
                peer,
                METHOD_EXCHANGE_GROUP_KEYS,
                vec![Value::byte_array(&payload)],
                MessageFlags::new().with_encrypted(),
                self.context.config().call_timeout,
            )
            .await?;
        let bytes = reply
            .first()
            .and_then(Value::as_byte_array)
            .ok_or(BusError::bad_reply("ExchangeGroupKeys reply missing key"))?;
        if bytes.len() != GROUP_KEY_PAYLOAD_LEN {
            return Err(BusError::bad_reply("group key payload has wrong length"));
        }
        let key = KeyBlob::new(KeyBlobKind::Aead, bytes[..aead::KEY_SIZE].to_vec())
            .with_tag(&state.auth_mechanism());
        let nonce = KeyBlob::new(KeyBlobKind::Nonce, bytes[aead::KEY_SIZE..].to_vec());
        state.set_key_and_nonce(KeyKind::Group, key, nonce);
        trace!(peer = %peer, "stored peer group key");
        Ok(())
    }

    /// Securing a connection to this same process: assign the group key
    /// and a random session pair with no network round trip.
    fn secure_self(&self, state: &Arc<PeerState>) -> BusResult<()> {
        let (group_key, group_nonce) = self.context.peers().group_key_and_nonce()?;
        let session_key = KeyBlob::new(KeyBlobKind::Aead, random::random_32()?.to_vec())
            .with_tag(SELF_MECHANISM);
        let session_nonce = KeyBlob::new(KeyBlobKind::Nonce, random::random_24()?.to_vec());
        state.set_local(true);
        state.set_key_and_nonce(KeyKind::Session, session_key, session_nonce);
        state.set_key_and_nonce(KeyKind::Group, group_key, group_nonce);
        state.set_auth_mechanism(SELF_MECHANISM);
        debug!("secured connection to self");
        Ok(())
    }

    // ============ Responder side ============

    /// Handle one inbound `org.tether.Bus.Peer` method call from
    /// `sender` and produce the reply arguments.
    ///
    /// # Errors
    ///
    /// [`BusError::UnknownMethod`] for a member not on the interface;
    /// per-method validation and security errors otherwise. Every error
    /// maps to an error reply at the dispatch layer.
    pub async fn dispatch_peer_call(
        &self,
        sender: &str,
        member: &str,
        args: &[Value],
    ) -> BusResult<Vec<Value>> {
        match member {
            METHOD_EXCHANGE_GUIDS => self.handle_exchange_guids(sender, args),
            METHOD_GEN_SESSION_KEY => self.handle_gen_session_key(sender, args),
            METHOD_EXCHANGE_GROUP_KEYS => self.handle_exchange_group_keys(sender, args),
            METHOD_AUTH_CHALLENGE => self.dispatch_auth_challenge(sender, args).await,
            METHOD_GET_EXPANSION => self.handle_get_expansion(args),
            other => Err(BusError::UnknownMethod(other.to_string().into())),
        }
    }

    fn handle_exchange_guids(&self, sender: &str, args: &[Value]) -> BusResult<Vec<Value>> {
        let guid_str = args
            .first()
            .and_then(Value::as_str)
            .ok_or(BusError::bad_argument("ExchangeGuids requires a GUID string"))?;
        let version = args
            .get(1)
            .and_then(Value::as_u32)
            .ok_or(BusError::bad_argument("ExchangeGuids requires a version"))?;
        let guid: Guid = guid_str
            .parse()
            .map_err(|_| BusError::bad_argument("ExchangeGuids GUID malformed"))?;
        if guid.is_empty() {
            return Err(BusError::no_peer_guid("caller sent an empty GUID"));
        }
        if version != PEER_AUTH_VERSION {
            debug!(version, "peer speaks a different auth version");
        }
        let state = self.context.peers().get_peer_state(sender, None);
        state.set_guid(guid);
        trace!(sender = %sender, guid = %guid.short(), "recorded peer GUID");
        Ok(vec![
            Value::String(self.context.local_guid().to_string()),
            Value::Uint32(PEER_AUTH_VERSION),
        ])
    }

    fn handle_gen_session_key(&self, sender: &str, args: &[Value]) -> BusResult<Vec<Value>> {
        let initiator_str = args.first().and_then(Value::as_str).ok_or(
            BusError::bad_argument("GenSessionKey requires the initiator GUID"),
        )?;
        let target_str = args
            .get(1)
            .and_then(Value::as_str)
            .ok_or(BusError::bad_argument("GenSessionKey requires the target GUID"))?;
        let remote_nonce_hex = args
            .get(2)
            .and_then(Value::as_str)
            .ok_or(BusError::bad_argument("GenSessionKey requires a nonce"))?;

        let initiator: Guid = initiator_str
            .parse()
            .map_err(|_| BusError::bad_argument("GenSessionKey initiator GUID malformed"))?;
        let target: Guid = target_str
            .parse()
            .map_err(|_| BusError::bad_argument("GenSessionKey target GUID malformed"))?;
        if target != self.context.local_guid() {
            return Err(BusError::no_peer_guid("GenSessionKey target is not this bus"));
        }
        if hex::decode(remote_nonce_hex).map(|n| n.len()) != Ok(SESSION_NONCE_LEN) {
            return Err(BusError::bad_argument("GenSessionKey nonce malformed"));
        }

        let master = self.context.key_store().get_key(&initiator)?;
        let mut local_nonce = [0u8; SESSION_NONCE_LEN];
        random::fill_random(&mut local_nonce)?;
        let local_nonce_hex = hex::encode(local_nonce);

        let seed = format!("{remote_nonce_hex}{local_nonce_hex}");
        let prf::SessionMatter {
            key,
            nonce,
            verifier,
        } = prf::derive_session_matter(&master, seed.as_bytes())?;

        let state = self.context.peers().get_peer_state(sender, None);
        if state.guid().is_empty() {
            state.set_guid(initiator);
        }
        state.set_key_and_nonce(KeyKind::Session, key, nonce);
        state.set_auth_mechanism(master.tag());
        debug!(sender = %sender, mechanism = master.tag(), "session key derived for peer");
        Ok(vec![
            Value::String(local_nonce_hex),
            Value::String(verifier),
        ])
    }

    fn handle_exchange_group_keys(&self, sender: &str, args: &[Value]) -> BusResult<Vec<Value>> {
        let bytes = args.first().and_then(Value::as_byte_array).ok_or(
            BusError::bad_argument("ExchangeGroupKeys requires a byte array"),
        )?;
        let Some(state) = self.context.peers().lookup(sender) else {
            return Err(BusError::no_peer_guid("ExchangeGroupKeys from an unknown peer"));
        };
        if !state.is_secure() {
            return Err(BusError::auth_failed(
                "ExchangeGroupKeys requires a secured connection",
            ));
        }
        if bytes.len() != GROUP_KEY_PAYLOAD_LEN {
            return Err(BusError::bad_argument(
                "ExchangeGroupKeys payload has wrong length",
            ));
        }
        let key = KeyBlob::new(KeyBlobKind::Aead, bytes[..aead::KEY_SIZE].to_vec())
            .with_tag(&state.auth_mechanism());
        let nonce = KeyBlob::new(KeyBlobKind::Nonce, bytes[aead::KEY_SIZE..].to_vec());
        state.set_key_and_nonce(KeyKind::Group, key, nonce);

        let (local_key, local_nonce) = self.context.peers().group_key_and_nonce()?;
        let mut payload = Vec::with_capacity(GROUP_KEY_PAYLOAD_LEN);
        payload.extend_from_slice(local_key.as_bytes());
        payload.extend_from_slice(local_nonce.as_bytes());
        debug!(sender = %sender, "exchanged group keys");
        Ok(vec![Value::byte_array(&payload)])
    }

    /// Queue the challenge for the supervisor and wait for its line.
    /// Conversations are only ever advanced there, one at a time.
    async fn dispatch_auth_challenge(&self, sender: &str, args: &[Value]) -> BusResult<Vec<Value>> {
        let line = args
            .first()
            .and_then(Value::as_str)
            .ok_or(BusError::bad_argument("AuthChallenge requires a line"))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(DeferredTask::AuthChallenge {
            sender: sender.to_string(),
            line: line.to_string(),
            reply: reply_tx,
        })?;
        let reply = reply_rx
            .await
            .map_err(|_| BusError::channel("deferred supervisor dropped the challenge"))??;
        Ok(vec![Value::String(reply)])
    }

    /// Advance (or begin) the challenger conversation for `sender`.
    /// Runs on the supervisor task only.
    fn handle_auth_challenge(&self, sender: &str, line: &str) -> BusResult<String> {
        if !self.context.security_enabled() {
            return Err(BusError::NoAuthMechanism);
        }
        let mut conversation = match self.conversations.remove(sender) {
            Some((_, conversation)) => conversation,
            None => AuthConversation::new_challenger(
                self.context.registry().clone(),
                self.context.auth_mechanisms(),
                self.context.local_guid(),
            ),
        };
        let reply = conversation.advance(line)?;
        match conversation.state() {
            ConversationState::Success => {
                if let Err(err) = self.finish_challenger_success(sender, &conversation) {
                    self.context.listener().authentication_complete(
                        conversation.mechanism_name(),
                        sender,
                        false,
                    );
                    return Err(err);
                }
            }
            ConversationState::Failure => {
                warn!(sender = %sender, mechanism = conversation.mechanism_name(), "peer failed authentication");
                self.context.listener().authentication_complete(
                    conversation.mechanism_name(),
                    sender,
                    false,
                );
            }
            _ => {
                self.conversations.insert(sender.to_string(), conversation);
            }
        }
        reply.ok_or(BusError::auth_failed("authentication abandoned by peer"))
    }

    /// Store the master secret a completed challenger conversation
    /// produced and report the outcome.
    fn finish_challenger_success(
        &self,
        sender: &str,
        conversation: &AuthConversation,
    ) -> BusResult<()> {
        let state = self.context.peers().get_peer_state(sender, None);
        let guid = state.guid();
        if guid.is_empty() {
            return Err(BusError::auth_failed(
                "peer completed authentication without exchanging GUIDs",
            ));
        }
        let master = conversation.master_secret()?;
        self.context.key_store().add_key(guid, master)?;
        self.context.persist_key_store()?;
        state.set_auth_mechanism(conversation.mechanism_name());
        debug!(sender = %sender, mechanism = conversation.mechanism_name(), "peer authenticated");
        self.context
            .listener()
            .authentication_complete(conversation.mechanism_name(), sender, true);
        Ok(())
    }

    fn handle_get_expansion(&self, args: &[Value]) -> BusResult<Vec<Value>> {
        let token = args
            .first()
            .and_then(Value::as_u32)
            .ok_or(BusError::bad_argument("GetExpansion requires a token"))?;
        match self.context.compression().expand(token) {
            Some(fields) => Ok(vec![fields.to_expansion_value()]),
            None => Err(BusError::Wire(WireError::CannotExpand { token })),
        }
    }

    // ============ Inbound pipeline hooks ============

    /// Queue an opportunistic `secure_peer_connection` on the supervisor.
    ///
    /// # Errors
    ///
    /// [`BusError::QueueExhausted`] when the deferred queue is full.
    pub fn queue_secure_peer(&self, peer: &str, force_reauth: bool) -> BusResult<()> {
        self.enqueue(DeferredTask::SecurePeer {
            peer: peer.to_string(),
            force_reauth,
        })
    }

    /// Queue a message awaiting header expansion on the supervisor.
    ///
    /// # Errors
    ///
    /// [`BusError::QueueExhausted`] when the deferred queue is full.
    pub fn queue_header_expansion(&self, message: Message, sender: &str) -> BusResult<()> {
        self.enqueue(DeferredTask::RequestExpansion {
            message,
            sender: sender.to_string(),
        })
    }

    /// Resolve a message's pending compression token, fetching the rule
    /// from the sender when the local table lacks it, then finish
    /// validating and route the message. No message is lost on the
    /// expansion path.
    ///
    /// # Errors
    ///
    /// [`BusError::ExpansionInvalid`] when the fetched rule still does
    /// not resolve the token, plus transport errors from `GetExpansion`.
    pub async fn request_header_expansion(
        &self,
        mut message: Message,
        sender: &str,
    ) -> BusResult<()> {
        if let Some(token) = message.needs_expansion() {
            let fields = match self.context.compression().expand(token) {
                Some(fields) => fields,
                None => self.fetch_expansion(token, sender).await?,
            };
            message.finish_expansion(fields);
        }
        self.deliver_expanded(message, sender).await
    }

    async fn fetch_expansion(&self, token: u32, sender: &str) -> BusResult<HeaderFields> {
        debug!(token, sender = %sender, "requesting header expansion");
        let reply = self
            .caller
            .call_method(
                sender,
                METHOD_GET_EXPANSION,
                vec![Value::Uint32(token)],
                MessageFlags::new(),
                self.context.config().call_timeout,
            )
            .await?;
        let value = reply
            .first()
            .ok_or(BusError::bad_reply("GetExpansion reply missing fields"))?;
        let fields = HeaderFields::from_expansion_value(value)?;
        self.context.compression().add_expansion(token, fields);
        self.context
            .compression()
            .expand(token)
            .ok_or(BusError::ExpansionInvalid)
    }

    /// Post-expansion tail of the receive path: the time to live is
    /// visible now, so expiry is rechecked before decrypt and routing.
    async fn deliver_expanded(&self, mut message: Message, sender: &str) -> BusResult<()> {
        if message.has_expired(wall_clock_ms()) {
            trace!(sender = %sender, serial = message.serial(), "expanded message already expired");
            return Ok(());
        }
        if message.is_encrypted() {
            if let Err(err) = self.decrypt_inbound(&mut message, sender) {
                self.handle_security_violation(&message, &err, sender);
                return Ok(());
            }
        }
        self.router.route(message, sender).await
    }

    /// Open a sealed inbound message with the sender's session key, or
    /// the sender's group key for broadcast signals.
    ///
    /// # Errors
    ///
    /// Every failure surfaces as [`BusError::DecryptionFailed`] so the
    /// violation handler can classify it uniformly.
    pub fn decrypt_inbound(&self, message: &mut Message, sender: &str) -> BusResult<()> {
        let Some(state) = self.context.peers().lookup(sender) else {
            return Err(BusError::decryption_failed("no security state for sender"));
        };
        let kind = if message.is_broadcast() {
            KeyKind::Group
        } else {
            KeyKind::Session
        };
        let (key_blob, nonce_blob) = state
            .get_key_and_nonce(kind)
            .map_err(|_| BusError::decryption_failed("no key negotiated with sender"))?;
        let key = AeadKey::from_blob(&key_blob)
            .map_err(|_| BusError::decryption_failed("key material is not usable"))?;
        message
            .decrypt_body(&key, nonce_blob.as_bytes())
            .map_err(|_| BusError::decryption_failed("message failed to authenticate"))?;
        trace!(sender = %sender, serial = message.serial(), "decrypted inbound message");
        Ok(())
    }

    /// Classify and react to a security failure on an inbound message.
    ///
    /// Decryption failure from a secure peer is a hard violation: the
    /// peer's keys are cleared and the violation reported. An
    /// undecryptable broadcast from a not-yet-secure peer triggers a
    /// best-effort securing attempt instead and is suppressed. Every
    /// other violation goes to the listener.
    pub fn handle_security_violation(&self, message: &Message, status: &BusError, sender: &str) {
        if matches!(status, BusError::DecryptionFailed(_)) {
            match self.context.peers().lookup(sender) {
                Some(state) if state.is_secure() => {
                    warn!(sender = %sender, "decryption failed on a secured connection, clearing keys");
                    state.clear_keys();
                }
                _ if message.is_broadcast() => {
                    debug!(sender = %sender, "undecryptable broadcast from unsecured peer, securing");
                    if let Err(err) = self.queue_secure_peer(sender, false) {
                        debug!(sender = %sender, error = %err, "could not queue securing");
                    }
                    return;
                }
                _ => {}
            }
        }
        self.context.listener().security_violation(status, message);
    }

    /// Drop all per-peer security state for a departed name: its peer
    /// state (aliases included) and any outstanding conversation.
    pub fn peer_name_lost(&self, name: &str) {
        debug!(name = %name, "peer name lost");
        self.conversations.remove(name);
        self.context.peers().del_peer_state(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthRegistry, EcdhKeyExchange};
    use crate::config::BusConfig;
    use crate::listener::NullListener;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoCaller;

    #[async_trait]
    impl MethodCaller for NoCaller {
        async fn call_method(
            &self,
            _destination: &str,
            _member: &str,
            _args: Vec<Value>,
            _flags: MessageFlags,
            _timeout: Duration,
        ) -> BusResult<Vec<Value>> {
            Err(BusError::channel("no remote in unit tests"))
        }
    }

    struct SinkRouter;

    #[async_trait]
    impl MessageRouter for SinkRouter {
        async fn route(&self, _message: Message, _sender: &str) -> BusResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<(String, String, bool)>>,
    }

    impl SecurityListener for RecordingListener {
        fn authentication_complete(&self, mechanism: &str, peer: &str, success: bool) {
            self.events
                .lock()
                .unwrap()
                .push((mechanism.to_string(), peer.to_string(), success));
        }

        fn security_violation(&self, _status: &BusError, _message: &Message) {}
    }

    fn test_coordinator() -> Arc<SecurityCoordinator> {
        let context = Arc::new(BusContext::new(BusConfig::default()).unwrap());
        SecurityCoordinator::new(context, Arc::new(NoCaller), Arc::new(SinkRouter))
    }

    fn context_of(coordinator: &SecurityCoordinator) -> &Arc<BusContext> {
        &coordinator.context
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let coordinator = test_coordinator();
        let err = coordinator
            .dispatch_peer_call(":1.2", "Bogus", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::UnknownMethod(_)));
    }

    #[tokio::test]
    async fn test_exchange_guids_records_peer() {
        let coordinator = test_coordinator();
        let remote = Guid::random().unwrap();
        let reply = coordinator
            .dispatch_peer_call(
                ":1.2",
                METHOD_EXCHANGE_GUIDS,
                &[Value::String(remote.to_string()), Value::Uint32(1)],
            )
            .await
            .unwrap();

        let local = context_of(&coordinator).local_guid();
        assert_eq!(reply[0].as_str(), Some(local.to_string().as_str()));
        assert_eq!(reply[1].as_u32(), Some(PEER_AUTH_VERSION));

        let state = context_of(&coordinator).peers().lookup(":1.2").unwrap();
        assert_eq!(state.guid(), remote);
    }

    #[tokio::test]
    async fn test_gen_session_key_requires_local_target() {
        let coordinator = test_coordinator();
        let err = coordinator
            .dispatch_peer_call(
                ":1.2",
                METHOD_GEN_SESSION_KEY,
                &[
                    Value::String(Guid::random().unwrap().to_string()),
                    Value::String(Guid::random().unwrap().to_string()),
                    Value::String("00".repeat(SESSION_NONCE_LEN)),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoPeerGuid(_)));
    }

    #[tokio::test]
    async fn test_gen_session_key_derives_matching_verifier() {
        let coordinator = test_coordinator();
        let context = context_of(&coordinator).clone();
        let initiator = Guid::random().unwrap();
        let master = KeyBlob::new(KeyBlobKind::Generic, vec![0x5a; 32]).with_tag("TEST");
        context.key_store().add_key(initiator, master.clone()).unwrap();

        let my_nonce_hex = "ab".repeat(SESSION_NONCE_LEN);
        let reply = coordinator
            .dispatch_peer_call(
                ":1.4",
                METHOD_GEN_SESSION_KEY,
                &[
                    Value::String(initiator.to_string()),
                    Value::String(context.local_guid().to_string()),
                    Value::String(my_nonce_hex.clone()),
                ],
            )
            .await
            .unwrap();

        let their_nonce_hex = reply[0].as_str().unwrap();
        let their_verifier = reply[1].as_str().unwrap();
        assert_eq!(their_nonce_hex.len(), SESSION_NONCE_LEN * 2);

        // Initiator-side derivation must agree.
        let seed = format!("{my_nonce_hex}{their_nonce_hex}");
        let matter = prf::derive_session_matter(&master, seed.as_bytes()).unwrap();
        assert!(prf::verifiers_match(&matter.verifier, their_verifier));

        let state = context.peers().lookup(":1.4").unwrap();
        assert!(state.is_secure());
        assert_eq!(state.auth_mechanism(), "TEST");
    }

    #[tokio::test]
    async fn test_exchange_group_keys_requires_known_secure_peer() {
        let coordinator = test_coordinator();
        let payload = Value::byte_array(&[0u8; GROUP_KEY_PAYLOAD_LEN]);

        let err = coordinator
            .dispatch_peer_call(":1.9", METHOD_EXCHANGE_GROUP_KEYS, &[payload.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoPeerGuid(_)));

        // Known but not secured is still refused.
        context_of(&coordinator).peers().get_peer_state(":1.9", None);
        let err = coordinator
            .dispatch_peer_call(":1.9", METHOD_EXCHANGE_GROUP_KEYS, &[payload])
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_get_expansion_unknown_token() {
        let coordinator = test_coordinator();
        let err = coordinator
            .dispatch_peer_call(":1.2", METHOD_GET_EXPANSION, &[Value::Uint32(99)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::Wire(WireError::CannotExpand { token: 99 })
        ));
    }

    #[tokio::test]
    async fn test_setup_rejects_unknown_mechanism() {
        let coordinator = test_coordinator();
        let err = coordinator
            .setup_peer_authentication("NOT_A_MECHANISM", Arc::new(NullListener))
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidMechanism(_)));
        assert!(!context_of(&coordinator).security_enabled());
    }

    #[tokio::test]
    async fn test_setup_empty_disables_security() {
        let coordinator = test_coordinator();
        coordinator
            .setup_peer_authentication(EcdhKeyExchange::NAME, Arc::new(NullListener))
            .unwrap();
        assert!(context_of(&coordinator).security_enabled());

        coordinator
            .setup_peer_authentication("", Arc::new(NullListener))
            .unwrap();
        assert!(!context_of(&coordinator).security_enabled());
    }

    #[tokio::test]
    async fn test_secure_peer_without_mechanisms() {
        let coordinator = test_coordinator();
        let err = coordinator
            .secure_peer_connection(":1.3", false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoAuthMechanism));
    }

    #[tokio::test]
    async fn test_inbound_authentication_stores_master_secret() {
        let coordinator = test_coordinator();
        let listener = Arc::new(RecordingListener::default());
        coordinator
            .setup_peer_authentication(EcdhKeyExchange::NAME, listener.clone())
            .unwrap();

        // Simulated remote responder with its own registry and identity.
        let registry = AuthRegistry::new();
        registry.register(
            EcdhKeyExchange::NAME,
            Box::new(|| Box::new(EcdhKeyExchange::new())),
        );
        let remote_guid = Guid::random().unwrap();
        let mut responder = AuthConversation::new_responder(
            Arc::new(registry),
            vec![EcdhKeyExchange::NAME.to_string()],
            remote_guid,
        );

        coordinator
            .dispatch_peer_call(
                ":1.7",
                METHOD_EXCHANGE_GUIDS,
                &[Value::String(remote_guid.to_string()), Value::Uint32(1)],
            )
            .await
            .unwrap();

        let mut line = responder.start().unwrap();
        for _ in 0..16 {
            let reply = coordinator
                .dispatch_peer_call(":1.7", METHOD_AUTH_CHALLENGE, &[Value::String(line)])
                .await
                .unwrap();
            let reply_line = reply[0].as_str().unwrap();
            match responder.advance(reply_line).unwrap() {
                Some(next) => line = next,
                None => break,
            }
        }

        assert_eq!(responder.state(), ConversationState::Success);
        assert!(context_of(&coordinator)
            .key_store()
            .has_key(&remote_guid)
            .unwrap());
        let events = listener.events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            &[(EcdhKeyExchange::NAME.to_string(), ":1.7".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_peer_name_lost_drops_state() {
        let coordinator = test_coordinator();
        context_of(&coordinator).peers().get_peer_state(":1.8", None);
        coordinator.peer_name_lost(":1.8");
        assert!(context_of(&coordinator).peers().lookup(":1.8").is_none());
    }
}
