//! Shared bus state.
//!
//! One [`BusContext`] lives for the life of the process and is shared
//! by the security coordinator and every endpoint: the local identity,
//! the serial counter, the peer state table, the key store, the header
//! compression table, and the mechanism registry all hang off it.

use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tether_crypto::keystore::KeyDerivationParams;
use tether_crypto::{Guid, KeyStore};
use tether_wire::CompressionTable;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::auth::{AuthRegistry, EcdhKeyExchange};
use crate::config::BusConfig;
use crate::error::BusResult;
use crate::listener::{NullListener, SecurityListener};
use crate::peer_state::PeerStateTable;

/// Callback that writes the key store out to durable storage.
pub type KeyStoreSink = Box<dyn Fn(&KeyStore) -> BusResult<()> + Send + Sync>;

/// Process-wide bus state shared across endpoints.
pub struct BusContext {
    local_guid: Guid,
    config: BusConfig,
    next_serial: AtomicU32,
    peers: PeerStateTable,
    key_store: KeyStore,
    persist: Option<KeyStoreSink>,
    compression: CompressionTable,
    registry: Arc<AuthRegistry>,
    /// Held across an entire outbound securing exchange so only one
    /// runs at a time in this process.
    securing: AsyncMutex<()>,
    listener: RwLock<Arc<dyn SecurityListener>>,
    auth_mechanisms: RwLock<Vec<String>>,
}

impl BusContext {
    /// Context with a fresh identity and a key store that lives only in
    /// memory. Negotiated keys are lost when the process exits.
    ///
    /// # Errors
    ///
    /// Returns an error when the OS CSPRNG fails.
    pub fn new(config: BusConfig) -> BusResult<Self> {
        let local_guid = Guid::random()?;
        let key_store = KeyStore::with_params(KeyDerivationParams::low_security());
        key_store.load(&mut std::io::empty(), local_guid.to_string().as_bytes())?;
        debug!(guid = %local_guid.short(), "created in-memory bus context");
        Ok(Self::assemble(local_guid, config, key_store, None))
    }

    /// Context backed by a persistent key store.
    ///
    /// The store is loaded from `source` up front; `sink` is invoked by
    /// [`persist_key_store`](Self::persist_key_store) whenever new keys
    /// must be written back. The local identity is the store's GUID, so
    /// it survives restarts. Both ends of the store's life must use the
    /// same derivation `params`.
    ///
    /// # Errors
    ///
    /// Propagates key store load failures, including a version mismatch
    /// on a foreign store.
    pub fn with_key_store<R: Read>(
        config: BusConfig,
        params: KeyDerivationParams,
        source: &mut R,
        password: &[u8],
        sink: KeyStoreSink,
    ) -> BusResult<Self> {
        let key_store = KeyStore::with_params(params);
        key_store.load(source, password)?;
        let local_guid = key_store.store_guid()?;
        debug!(guid = %local_guid.short(), "loaded persistent bus context");
        Ok(Self::assemble(local_guid, config, key_store, Some(sink)))
    }

    fn assemble(
        local_guid: Guid,
        config: BusConfig,
        key_store: KeyStore,
        persist: Option<KeyStoreSink>,
    ) -> Self {
        let registry = AuthRegistry::new();
        registry.register(
            EcdhKeyExchange::NAME,
            Box::new(|| Box::new(EcdhKeyExchange::new())),
        );
        let compression = CompressionTable::with_capacity(config.compression_capacity);
        Self {
            local_guid,
            config,
            next_serial: AtomicU32::new(1),
            peers: PeerStateTable::new(),
            key_store,
            persist,
            compression,
            registry: Arc::new(registry),
            securing: AsyncMutex::new(()),
            listener: RwLock::new(Arc::new(NullListener)),
            auth_mechanisms: RwLock::new(Vec::new()),
        }
    }

    /// This bus instance's stable identity.
    #[must_use]
    pub fn local_guid(&self) -> Guid {
        self.local_guid
    }

    /// Tunables this context was built with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Next message serial. Wraps around, never returns zero.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Per-peer security and replay state.
    #[must_use]
    pub fn peers(&self) -> &PeerStateTable {
        &self.peers
    }

    /// Master secrets negotiated so far, keyed by peer GUID.
    #[must_use]
    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// Write the key store out through the configured sink, if any.
    ///
    /// # Errors
    ///
    /// Propagates whatever the sink reports.
    pub fn persist_key_store(&self) -> BusResult<()> {
        match &self.persist {
            Some(sink) => sink(&self.key_store),
            None => Ok(()),
        }
    }

    /// Header field expansion rules learned from peers.
    #[must_use]
    pub fn compression(&self) -> &CompressionTable {
        &self.compression
    }

    /// Installed authentication mechanisms.
    #[must_use]
    pub fn registry(&self) -> &Arc<AuthRegistry> {
        &self.registry
    }

    /// Lock serializing outbound securing exchanges process-wide.
    #[must_use]
    pub fn securing_lock(&self) -> &AsyncMutex<()> {
        &self.securing
    }

    /// The listener told about authentication outcomes and violations.
    #[must_use]
    pub fn listener(&self) -> Arc<dyn SecurityListener> {
        self.listener.read().unwrap().clone()
    }

    /// Replace the security listener.
    pub fn set_listener(&self, listener: Arc<dyn SecurityListener>) {
        *self.listener.write().unwrap() = listener;
    }

    /// Mechanism names this bus will negotiate with, in preference order.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.auth_mechanisms.read().unwrap().clone()
    }

    /// Install the negotiable mechanism set. Names are assumed already
    /// validated against the registry.
    pub fn set_auth_mechanisms(&self, names: Vec<String>) {
        *self.auth_mechanisms.write().unwrap() = names;
    }

    /// Whether peer security has been enabled on this bus.
    #[must_use]
    pub fn security_enabled(&self) -> bool {
        !self.auth_mechanisms.read().unwrap().is_empty()
    }
}
