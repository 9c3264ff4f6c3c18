//! # Persistent Key Store
//!
//! Encrypted at-rest storage for per-peer key material, keyed by peer GUID.
//!
//! ## Store Format
//!
//! ```text
//! +--------------+-----------------+-------------+------------------+------------+
//! | Version (2B) | Store GUID (16B)| Nonce (24B) | CiphertextLen(8B)| Ciphertext |
//! +--------------+-----------------+-------------+------------------+------------+
//! ```
//!
//! All integers are little-endian. The ciphertext, once opened, is a flat
//! sequence of `[guid: 16B][key blob]` records; a ciphertext length of zero
//! denotes an empty store. The store key is derived with Argon2id from the
//! caller's password, salted with the store GUID, and the payload is sealed
//! with XChaCha20-Poly1305.
//!
//! ## State Machine
//!
//! ```text
//! Unavailable --load--> Loaded <--store-- Modified
//!                         |                  ^
//!                         +---add/del key----+
//! ```
//!
//! A store that fails to decrypt or parse (wrong password, stale payload)
//! loads as a valid empty `Modified` store so the next `store` call replaces
//! it. A version-tag mismatch or structurally corrupt source is a hard error
//! and leaves nothing loaded.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Mutex;

use argon2::{Algorithm, Argon2, Params, ParamsBuilder, Version};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::aead::{AeadKey, Nonce, NONCE_SIZE};
use crate::error::CryptoError;
use crate::guid::Guid;
use crate::keyblob::KeyBlob;
use crate::random::random_24;
use crate::GUID_SIZE;

/// Version tag written at the head of every persisted store.
pub const STORE_VERSION: u16 = 0x0101;

/// Upper bound on the encrypted payload. Anything larger is corrupt.
const MAX_CIPHERTEXT_LEN: u64 = 1024 * 1024;

/// Bytes before the nonce: version tag plus store GUID.
const HEADER_LEN: usize = 2 + GUID_SIZE;

/// Bytes before the ciphertext: header, nonce, ciphertext length.
const PREAMBLE_LEN: usize = HEADER_LEN + NONCE_SIZE + 8;

/// Hard cap on how much a load will pull from its source.
const MAX_SOURCE_LEN: u64 = PREAMBLE_LEN as u64 + MAX_CIPHERTEXT_LEN + 1;

/// Parameters for Argon2id store-key derivation.
///
/// Both ends of a persisted store must use the same parameters; they are not
/// recorded in the store itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivationParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_cost_kib: u32,
    /// Number of iterations (default: 4)
    pub iterations: u32,
    /// Degree of parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        // OWASP-recommended parameters for password hashing
        Self {
            memory_cost_kib: 65536,
            iterations: 4,
            parallelism: 4,
        }
    }
}

impl KeyDerivationParams {
    /// Low-cost parameters for tests and constrained environments.
    ///
    /// **Warning:** not suitable for production stores.
    #[must_use]
    pub fn low_security() -> Self {
        Self {
            memory_cost_kib: 4096,
            iterations: 2,
            parallelism: 1,
        }
    }

    fn validate(&self) -> Result<(), CryptoError> {
        // Argon2 minimum memory is 8 KiB.
        if self.memory_cost_kib < 8 {
            return Err(CryptoError::InvalidParameter(
                "memory_cost_kib must be at least 8 KiB".into(),
            ));
        }
        if self.iterations < 1 {
            return Err(CryptoError::InvalidParameter(
                "iterations must be at least 1".into(),
            ));
        }
        if self.parallelism < 1 || self.parallelism > 255 {
            return Err(CryptoError::InvalidParameter(
                "parallelism must be between 1 and 255".into(),
            ));
        }
        Ok(())
    }

    fn argon2_params(&self) -> Result<Params, CryptoError> {
        self.validate()?;

        ParamsBuilder::new()
            .m_cost(self.memory_cost_kib)
            .t_cost(self.iterations)
            .p_cost(self.parallelism)
            .build()
            .map_err(|e| CryptoError::InvalidParameter(format!("Argon2 params: {e}")))
    }
}

/// Lifecycle state of a [`KeyStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStoreState {
    /// No source has been loaded; every key operation fails.
    Unavailable,
    /// In-memory map matches the persisted form.
    Loaded,
    /// In-memory map has changes the next `store` must write out.
    Modified,
}

struct Inner {
    state: KeyStoreState,
    store_guid: Guid,
    store_key: Option<AeadKey>,
    keys: HashMap<Guid, KeyBlob>,
}

/// Encrypted persistent map from peer GUID to key blob.
///
/// One lock guards the map, the state tag, and the store key together, so a
/// load is never interleaved with a key lookup.
pub struct KeyStore {
    params: KeyDerivationParams,
    inner: Mutex<Inner>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    /// Create an unloaded store with default derivation parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(KeyDerivationParams::default())
    }

    /// Create an unloaded store with explicit derivation parameters.
    #[must_use]
    pub fn with_params(params: KeyDerivationParams) -> Self {
        Self {
            params,
            inner: Mutex::new(Inner {
                state: KeyStoreState::Unavailable,
                store_guid: Guid::EMPTY,
                store_key: None,
                keys: HashMap::new(),
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> KeyStoreState {
        self.inner.lock().unwrap().state
    }

    /// The GUID this store was created or loaded with.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::StoreNotLoaded` before the first successful load.
    pub fn store_guid(&self) -> Result<Guid, CryptoError> {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            KeyStoreState::Unavailable => Err(CryptoError::StoreNotLoaded),
            _ => Ok(inner.store_guid),
        }
    }

    /// Load the store from a byte source.
    ///
    /// An empty source is a brand-new store: a fresh store GUID is generated
    /// and the state becomes `Modified` so the next `store` persists it. A
    /// payload that fails to decrypt or parse loads as an empty `Modified`
    /// store. Loading an already-loaded store is a no-op.
    ///
    /// # Errors
    ///
    /// - `CryptoError::StoreRead` if the source cannot be read.
    /// - `CryptoError::StoreVersionMismatch` on a foreign version tag; the
    ///   store stays unloaded.
    /// - `CryptoError::CorruptStore` on a truncated or oversized source.
    pub fn load<R: Read>(&self, source: &mut R, password: &[u8]) -> Result<(), CryptoError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != KeyStoreState::Unavailable {
            return Ok(());
        }

        let mut data = Vec::new();
        source
            .take(MAX_SOURCE_LEN)
            .read_to_end(&mut data)
            .map_err(|e| CryptoError::StoreRead(e.to_string()))?;
        if data.len() as u64 >= MAX_SOURCE_LEN {
            inner.keys.clear();
            return Err(CryptoError::CorruptStore(
                "store exceeds maximum size".into(),
            ));
        }

        if data.is_empty() {
            let store_guid = Guid::random()?;
            inner.store_key = Some(self.derive_store_key(password, &store_guid)?);
            inner.store_guid = store_guid;
            inner.keys.clear();
            inner.state = KeyStoreState::Modified;
            debug!(store_guid = %store_guid.short(), "created new key store");
            return Ok(());
        }

        if data.len() < HEADER_LEN {
            inner.keys.clear();
            return Err(CryptoError::CorruptStore("truncated store header".into()));
        }

        let version = u16::from_le_bytes([data[0], data[1]]);
        if version != STORE_VERSION {
            return Err(CryptoError::StoreVersionMismatch {
                expected: STORE_VERSION,
                actual: version,
            });
        }

        let mut raw_guid = [0u8; GUID_SIZE];
        raw_guid.copy_from_slice(&data[2..HEADER_LEN]);
        let store_guid = Guid::from_bytes(raw_guid);
        let store_key = self.derive_store_key(password, &store_guid)?;

        // A header-only source is a valid empty store.
        if data.len() == HEADER_LEN {
            inner.store_guid = store_guid;
            inner.store_key = Some(store_key);
            inner.keys.clear();
            inner.state = KeyStoreState::Loaded;
            return Ok(());
        }

        if data.len() < PREAMBLE_LEN {
            inner.keys.clear();
            return Err(CryptoError::CorruptStore("truncated store header".into()));
        }

        let nonce = Nonce::from_slice(&data[HEADER_LEN..HEADER_LEN + NONCE_SIZE])
            .ok_or(CryptoError::InvalidNonceLength)?;
        let mut raw_len = [0u8; 8];
        raw_len.copy_from_slice(&data[HEADER_LEN + NONCE_SIZE..PREAMBLE_LEN]);
        let ciphertext_len = u64::from_le_bytes(raw_len);

        if ciphertext_len > MAX_CIPHERTEXT_LEN {
            inner.keys.clear();
            return Err(CryptoError::CorruptStore(format!(
                "ciphertext length {ciphertext_len} exceeds bound"
            )));
        }

        inner.store_guid = store_guid;
        inner.store_key = Some(store_key);

        if ciphertext_len == 0 {
            inner.keys.clear();
            inner.state = KeyStoreState::Loaded;
            return Ok(());
        }

        if (data.len() - PREAMBLE_LEN) as u64 != ciphertext_len {
            inner.keys.clear();
            return Err(CryptoError::CorruptStore(
                "ciphertext length disagrees with source".into(),
            ));
        }

        let key = inner.store_key.as_ref().ok_or(CryptoError::StoreNotLoaded)?;
        let mut plaintext = match key.decrypt(&nonce, &data[PREAMBLE_LEN..], b"") {
            Ok(p) => p,
            Err(_) => {
                warn!(
                    store_guid = %store_guid.short(),
                    "key store decryption failed, starting with an empty store"
                );
                inner.keys.clear();
                inner.state = KeyStoreState::Modified;
                return Ok(());
            }
        };

        let parsed = parse_records(&plaintext);
        plaintext.zeroize();
        let mut keys = match parsed {
            Ok(keys) => keys,
            Err(e) => {
                warn!(
                    store_guid = %store_guid.short(),
                    error = %e,
                    "key store payload unparsable, starting with an empty store"
                );
                inner.keys.clear();
                inner.state = KeyStoreState::Modified;
                return Ok(());
            }
        };

        let before = keys.len();
        keys.retain(|_, blob| !blob.has_expired());
        let purged = before - keys.len();

        debug!(
            store_guid = %store_guid.short(),
            keys = keys.len(),
            purged,
            "key store loaded"
        );

        inner.keys = keys;
        inner.state = if purged > 0 {
            KeyStoreState::Modified
        } else {
            KeyStoreState::Loaded
        };
        Ok(())
    }

    /// Persist the store to a byte sink.
    ///
    /// A no-op unless the store has unpersisted changes. Expired blobs are
    /// purged before writing, and the payload is sealed under a fresh nonce.
    ///
    /// # Errors
    ///
    /// - `CryptoError::StoreNotLoaded` before the first load.
    /// - `CryptoError::StoreWrite` if serialization or the sink fails.
    /// - `CryptoError::EncryptionFailed` if sealing fails.
    pub fn store<W: Write>(&self, sink: &mut W) -> Result<(), CryptoError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            KeyStoreState::Unavailable => return Err(CryptoError::StoreNotLoaded),
            KeyStoreState::Loaded => return Ok(()),
            KeyStoreState::Modified => {}
        }

        inner.keys.retain(|_, blob| !blob.has_expired());

        let mut plaintext = serialize_records(&inner.keys)?;
        let nonce = Nonce::from_bytes(random_24()?);
        let key = inner.store_key.as_ref().ok_or(CryptoError::StoreNotLoaded)?;
        let ciphertext = if plaintext.is_empty() {
            Vec::new()
        } else {
            key.encrypt(&nonce, &plaintext, b"")?
        };
        plaintext.zeroize();

        let mut out = Vec::with_capacity(PREAMBLE_LEN + ciphertext.len());
        out.extend_from_slice(&STORE_VERSION.to_le_bytes());
        out.extend_from_slice(inner.store_guid.as_bytes());
        out.extend_from_slice(nonce.as_bytes());
        out.extend_from_slice(&(ciphertext.len() as u64).to_le_bytes());
        out.extend_from_slice(&ciphertext);

        sink.write_all(&out)
            .map_err(|e| CryptoError::StoreWrite(e.to_string()))?;

        debug!(
            store_guid = %inner.store_guid.short(),
            keys = inner.keys.len(),
            "key store persisted"
        );
        inner.state = KeyStoreState::Loaded;
        Ok(())
    }

    /// Fetch the key blob stored for `guid`.
    ///
    /// An expired blob is removed on access and reported as unavailable.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::StoreNotLoaded` before the first load and
    /// `CryptoError::KeyUnavailable` when no live blob exists for `guid`.
    pub fn get_key(&self, guid: &Guid) -> Result<KeyBlob, CryptoError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == KeyStoreState::Unavailable {
            return Err(CryptoError::StoreNotLoaded);
        }
        match inner.keys.get(guid) {
            Some(blob) if blob.has_expired() => {
                inner.keys.remove(guid);
                inner.state = KeyStoreState::Modified;
                Err(CryptoError::KeyUnavailable)
            }
            Some(blob) => Ok(blob.clone()),
            None => Err(CryptoError::KeyUnavailable),
        }
    }

    /// Whether a blob is stored for `guid`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::StoreNotLoaded` before the first load.
    pub fn has_key(&self, guid: &Guid) -> Result<bool, CryptoError> {
        let inner = self.inner.lock().unwrap();
        if inner.state == KeyStoreState::Unavailable {
            return Err(CryptoError::StoreNotLoaded);
        }
        Ok(inner.keys.contains_key(guid))
    }

    /// Insert or replace the blob for `guid` and mark the store modified.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::StoreNotLoaded` before the first load.
    pub fn add_key(&self, guid: Guid, blob: KeyBlob) -> Result<(), CryptoError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == KeyStoreState::Unavailable {
            return Err(CryptoError::StoreNotLoaded);
        }
        inner.keys.insert(guid, blob);
        inner.state = KeyStoreState::Modified;
        Ok(())
    }

    /// Remove the blob for `guid`, if any, and mark the store modified.
    ///
    /// Deleting an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::StoreNotLoaded` before the first load.
    pub fn del_key(&self, guid: &Guid) -> Result<(), CryptoError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == KeyStoreState::Unavailable {
            return Err(CryptoError::StoreNotLoaded);
        }
        inner.keys.remove(guid);
        inner.state = KeyStoreState::Modified;
        Ok(())
    }

    fn derive_store_key(&self, password: &[u8], guid: &Guid) -> Result<AeadKey, CryptoError> {
        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            self.params.argon2_params()?,
        );

        let mut derived = [0u8; crate::AEAD_KEY_SIZE];
        argon2
            .hash_password_into(password, guid.as_bytes(), &mut derived)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        let key = AeadKey::new(derived);
        derived.zeroize();
        Ok(key)
    }
}

/// Decode the flat `[guid][blob]` record sequence.
fn parse_records(bytes: &[u8]) -> Result<HashMap<Guid, KeyBlob>, CryptoError> {
    let mut keys = HashMap::new();
    let mut cursor = Cursor::new(bytes);

    while (cursor.position() as usize) < bytes.len() {
        let mut raw_guid = [0u8; GUID_SIZE];
        cursor
            .read_exact(&mut raw_guid)
            .map_err(|e| CryptoError::CorruptStore(format!("record guid: {e}")))?;
        let blob: KeyBlob = bincode::deserialize_from(&mut cursor)
            .map_err(|e| CryptoError::CorruptStore(format!("record blob: {e}")))?;
        keys.insert(Guid::from_bytes(raw_guid), blob);
    }

    Ok(keys)
}

/// Encode the key map as a flat `[guid][blob]` record sequence.
fn serialize_records(keys: &HashMap<Guid, KeyBlob>) -> Result<Vec<u8>, CryptoError> {
    let mut buf = Vec::new();
    for (guid, blob) in keys {
        buf.extend_from_slice(guid.as_bytes());
        bincode::serialize_into(&mut buf, blob)
            .map_err(|e| CryptoError::StoreWrite(e.to_string()))?;
    }
    Ok(buf)
}
