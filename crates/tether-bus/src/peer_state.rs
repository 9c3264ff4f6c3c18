//! Per-peer security state and the process-wide peer table.
//!
//! One [`PeerState`] exists per remote peer identity. Bus names are the
//! lookup keys: a peer's unique name and any well-known aliases all map
//! to the same shared state. The table also owns the single process-wide
//! group key used for broadcast traffic.
//!
//! The replay window is deliberately lenient: it is an anti-replay
//! filter over the last serial seen per slot, not an ordering check, so
//! out-of-order unreliable and broadcast traffic still passes.

use crate::error::{BusError, BusResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tether_crypto::keyblob::{KeyBlob, KeyBlobKind};
use tether_crypto::{Guid, random};
use tether_wire::message::wall_clock_ms;
use tracing::{debug, warn};

/// Slots in the anti-replay serial window.
pub const REPLAY_WINDOW_SIZE: usize = 128;

/// Milliseconds between forced +1 clock-offset nudges.
pub const DRIFT_NUDGE_INTERVAL_MS: u32 = 10_000;

/// Which key pair of a peer state an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Pairwise session key negotiated with this peer.
    Session,
    /// The peer's broadcast group key, received via `ExchangeGroupKeys`.
    Group,
}

struct PeerStateInner {
    guid: Guid,
    is_local: bool,
    is_secure: bool,
    auth_mechanism: String,
    session_pair: Option<(KeyBlob, KeyBlob)>,
    group_pair: Option<(KeyBlob, KeyBlob)>,
    window: [u32; REPLAY_WINDOW_SIZE],
    clock_offset: i32,
    first_adjust: bool,
    last_drift_adjust: u32,
}

/// Security state for one remote peer.
///
/// All mutable state sits behind the peer's own lock; critical sections
/// are short and never await.
pub struct PeerState {
    inner: Mutex<PeerStateInner>,
}

impl PeerState {
    /// Fresh state for a peer nothing is known about yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PeerStateInner {
                guid: Guid::EMPTY,
                is_local: false,
                is_secure: false,
                auth_mechanism: String::new(),
                session_pair: None,
                group_pair: None,
                window: [0; REPLAY_WINDOW_SIZE],
                clock_offset: 0,
                first_adjust: true,
                last_drift_adjust: 0,
            }),
        }
    }

    /// The peer's GUID, empty until `ExchangeGuids` records it.
    #[must_use]
    pub fn guid(&self) -> Guid {
        self.inner.lock().unwrap().guid
    }

    /// Record the peer's GUID.
    pub fn set_guid(&self, guid: Guid) {
        self.inner.lock().unwrap().guid = guid;
    }

    /// Whether this state describes the local process itself.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.inner.lock().unwrap().is_local
    }

    /// Mark this state as the loopback self-peer.
    pub fn set_local(&self, local: bool) {
        self.inner.lock().unwrap().is_local = local;
    }

    /// Whether a valid session key pair is installed.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.inner.lock().unwrap().is_secure
    }

    /// Name of the mechanism that authenticated this peer, empty before
    /// the first successful negotiation.
    #[must_use]
    pub fn auth_mechanism(&self) -> String {
        self.inner.lock().unwrap().auth_mechanism.clone()
    }

    /// Record the mechanism that produced the current session key.
    pub fn set_auth_mechanism(&self, mechanism: &str) {
        self.inner.lock().unwrap().auth_mechanism = mechanism.to_string();
    }

    /// Anti-replay check for an inbound serial number.
    ///
    /// Serial 0 is always invalid. Otherwise the serial is accepted iff
    /// it differs from the last serial stored in its window slot, and
    /// the slot is updated. `secure` and `unreliable` describe the
    /// message for logging; the caller decides whether a rejection is
    /// fatal for the connection.
    pub fn is_valid_serial(&self, serial: u32, secure: bool, unreliable: bool) -> bool {
        if serial == 0 {
            warn!(secure, unreliable, "message with serial 0 rejected");
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        let slot = serial as usize % REPLAY_WINDOW_SIZE;
        if inner.window[slot] == serial {
            debug!(
                serial,
                secure, unreliable, "repeated serial rejected by replay window"
            );
            return false;
        }
        inner.window[slot] = serial;
        true
    }

    /// Translate a remote timestamp into the local clock domain.
    ///
    /// Tracks a signed offset that only decreases, except for a +1 ms
    /// nudge every [`DRIFT_NUDGE_INTERVAL_MS`] to force periodic
    /// re-confirmation against a drifting remote clock.
    #[must_use]
    pub fn estimate_timestamp(&self, remote_ms: u32) -> u32 {
        self.estimate_at(remote_ms, wall_clock_ms())
    }

    /// [`estimate_timestamp`](Self::estimate_timestamp) with an explicit
    /// local clock sample.
    #[must_use]
    pub fn estimate_at(&self, remote_ms: u32, local_ms: u32) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let delta = local_ms.wrapping_sub(remote_ms) as i32;
        if inner.first_adjust || delta < inner.clock_offset {
            inner.clock_offset = delta;
            inner.first_adjust = false;
            inner.last_drift_adjust = local_ms;
        } else if local_ms.wrapping_sub(inner.last_drift_adjust) > DRIFT_NUDGE_INTERVAL_MS {
            inner.last_drift_adjust = local_ms;
            inner.clock_offset = inner.clock_offset.wrapping_add(1);
        }
        remote_ms.wrapping_add(inner.clock_offset as u32)
    }

    /// Install a key + base-nonce pair.
    ///
    /// Installing the session pair recomputes the secure flag from the
    /// validity of both blobs.
    pub fn set_key_and_nonce(&self, kind: KeyKind, key: KeyBlob, nonce: KeyBlob) {
        let mut inner = self.inner.lock().unwrap();
        let valid = key.is_valid() && nonce.is_valid();
        match kind {
            KeyKind::Session => {
                inner.session_pair = Some((key, nonce));
                inner.is_secure = valid;
            }
            KeyKind::Group => {
                inner.group_pair = Some((key, nonce));
            }
        }
    }

    /// Fetch a key + base-nonce pair.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::KeyUnavailable`] when the pair is missing,
    /// expired, or was cleared.
    pub fn get_key_and_nonce(&self, kind: KeyKind) -> BusResult<(KeyBlob, KeyBlob)> {
        let inner = self.inner.lock().unwrap();
        let pair = match kind {
            KeyKind::Session => &inner.session_pair,
            KeyKind::Group => &inner.group_pair,
        };
        match pair {
            Some((key, nonce)) if key.is_valid() && nonce.is_valid() => {
                Ok((key.clone(), nonce.clone()))
            }
            _ => Err(match kind {
                KeyKind::Session => BusError::key_unavailable("no session key for peer"),
                KeyKind::Group => BusError::key_unavailable("no group key for peer"),
            }),
        }
    }

    /// Erase both key pairs and drop the secure flag, atomically under
    /// the peer's lock.
    pub fn clear_keys(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((key, nonce)) = inner.session_pair.as_mut() {
            key.erase();
            nonce.erase();
        }
        if let Some((key, nonce)) = inner.group_pair.as_mut() {
            key.erase();
            nonce.erase();
        }
        inner.session_pair = None;
        inner.group_pair = None;
        inner.is_secure = false;
        inner.auth_mechanism.clear();
    }
}

impl Default for PeerState {
    fn default() -> Self {
        Self::new()
    }
}

struct TableInner {
    names: HashMap<String, Arc<PeerState>>,
    group_pair: Option<(KeyBlob, KeyBlob)>,
}

/// Process-wide map from bus names to peer states, plus the local group
/// key.
///
/// One lock guards the name map and the group key; each peer's mutable
/// state sits behind its own lock. The table lock is always taken before
/// a peer lock, never the other way around.
pub struct PeerStateTable {
    inner: Mutex<TableInner>,
}

impl PeerStateTable {
    /// Empty table with no group key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                names: HashMap::new(),
                group_pair: None,
            }),
        }
    }

    /// State for `unique_name`, created on first reference.
    ///
    /// When `alias` is given, both names map to the same state
    /// afterwards, whichever of them was known before. Unique names
    /// conventionally begin with `:`.
    pub fn get_peer_state(&self, unique_name: &str, alias: Option<&str>) -> Arc<PeerState> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner
            .names
            .get(unique_name)
            .cloned()
            .or_else(|| alias.and_then(|a| inner.names.get(a).cloned()));
        let state = existing.unwrap_or_else(|| {
            debug!(name = unique_name, "creating peer state");
            Arc::new(PeerState::new())
        });
        inner
            .names
            .insert(unique_name.to_string(), Arc::clone(&state));
        if let Some(alias) = alias {
            if alias != unique_name {
                inner.names.insert(alias.to_string(), Arc::clone(&state));
            }
        }
        state
    }

    /// State for `name` if one exists, without creating it.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<PeerState>> {
        self.inner.lock().unwrap().names.get(name).cloned()
    }

    /// Drop the state registered under `name`, aliases included.
    ///
    /// When the group key exists and no secure non-local peer remains
    /// afterwards, the group key is erased; the next broadcast secures
    /// under a fresh one.
    pub fn del_peer_state(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.names.remove(name) else {
            return;
        };
        inner.names.retain(|_, s| !Arc::ptr_eq(s, &state));
        state.clear_keys();
        if inner.group_pair.is_some() {
            let any_secure = inner
                .names
                .values()
                .any(|s| s.is_secure() && !s.is_local());
            if !any_secure {
                debug!("erasing group key; no secure peers remain");
                if let Some((key, nonce)) = inner.group_pair.as_mut() {
                    key.erase();
                    nonce.erase();
                }
                inner.group_pair = None;
            }
        }
    }

    /// The local group key + base nonce, generated lazily on first use.
    ///
    /// # Errors
    ///
    /// Returns a crypto error when the system randomness source fails.
    pub fn group_key_and_nonce(&self) -> BusResult<(KeyBlob, KeyBlob)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some((key, nonce)) = &inner.group_pair {
            return Ok((key.clone(), nonce.clone()));
        }
        debug!("generating process group key");
        let key = KeyBlob::new(KeyBlobKind::Aead, random::random_32()?.to_vec());
        let nonce = KeyBlob::new(KeyBlobKind::Nonce, random::random_24()?.to_vec());
        let out = (key.clone(), nonce.clone());
        inner.group_pair = Some((key, nonce));
        Ok(out)
    }

    /// Erase every peer state and the group key.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        for state in inner.names.values() {
            state.clear_keys();
        }
        inner.names.clear();
        if let Some((key, nonce)) = inner.group_pair.as_mut() {
            key.erase();
            nonce.erase();
        }
        inner.group_pair = None;
    }

    /// Number of registered names, aliases counted separately.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().names.len()
    }

    /// Whether no names are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PeerStateTable {
    fn default() -> Self {
        Self::new()
    }
}
