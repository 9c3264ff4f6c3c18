//! Tagged, expiring key material.
//!
//! A [`KeyBlob`] carries secret bytes plus the metadata the bus needs to
//! reason about them: a kind, an optional expiry, and a free-form tag
//! (by convention the name of the authentication mechanism that produced
//! the key). Blob contents are zeroized on drop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::random;

/// Maximum tag length in bytes; longer tags are truncated.
pub const MAX_TAG_LEN: usize = 63;

/// What a key blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyBlobKind {
    /// Opaque secret bytes (master secrets, verifier hashes).
    Generic,
    /// A 32-byte AEAD key.
    Aead,
    /// A 24-byte AEAD nonce.
    Nonce,
}

/// Secret key material with kind, tag, and optional expiry.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyBlob {
    #[zeroize(skip)]
    kind: KeyBlobKind,
    data: Vec<u8>,
    #[zeroize(skip)]
    tag: String,
    /// Absolute expiry as milliseconds since the Unix epoch.
    #[zeroize(skip)]
    expiration_ms: Option<u64>,
}

impl KeyBlob {
    /// Create a blob from existing secret bytes.
    #[must_use]
    pub fn new(kind: KeyBlobKind, data: Vec<u8>) -> Self {
        Self {
            kind,
            data,
            tag: String::new(),
            expiration_ms: None,
        }
    }

    /// Create a blob filled with `len` random bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn random(kind: KeyBlobKind, len: usize) -> Result<Self, CryptoError> {
        let mut data = vec![0u8; len];
        random::fill_random(&mut data)?;
        Ok(Self::new(kind, data))
    }

    /// Blob kind.
    #[must_use]
    pub fn kind(&self) -> KeyBlobKind {
        self.kind
    }

    /// Secret bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Length of the secret in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the blob holds no material.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when the blob holds usable (non-empty, unexpired) material.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty() && !self.has_expired()
    }

    /// Set the tag, truncated to [`MAX_TAG_LEN`] bytes.
    pub fn set_tag(&mut self, tag: &str) {
        let mut end = tag.len().min(MAX_TAG_LEN);
        while !tag.is_char_boundary(end) {
            end -= 1;
        }
        self.tag = tag[..end].to_owned();
    }

    /// The tag, empty when never set.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Builder-style tag assignment.
    #[must_use]
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.set_tag(tag);
        self
    }

    /// Expire this blob `lifetime` from now.
    pub fn set_expiration(&mut self, lifetime: Duration) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.expiration_ms = Some((now + lifetime).as_millis() as u64);
    }

    /// True once the expiry instant has passed.
    #[must_use]
    pub fn has_expired(&self) -> bool {
        match self.expiration_ms {
            None => false,
            Some(expiry) => {
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_millis() as u64;
                now_ms >= expiry
            }
        }
    }

    /// XOR `other` into the secret, up to the shorter length.
    ///
    /// Returns the number of bytes combined.
    pub fn xor_with(&mut self, other: &[u8]) -> usize {
        let n = self.data.len().min(other.len());
        for (dst, src) in self.data.iter_mut().zip(other.iter().take(n)) {
            *dst ^= src;
        }
        n
    }

    /// Wipe the secret and drop the metadata back to an empty generic blob.
    pub fn erase(&mut self) {
        self.data.zeroize();
        self.data.clear();
        self.kind = KeyBlobKind::Generic;
        self.tag.clear();
        self.expiration_ms = None;
    }
}

impl std::fmt::Debug for KeyBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret bytes stay out of logs.
        f.debug_struct("KeyBlob")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("tag", &self.tag)
            .field("expiration_ms", &self.expiration_ms)
            .finish()
    }
}

impl PartialEq for KeyBlob {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.data == other.data
            && self.tag == other.tag
            && self.expiration_ms == other.expiration_ms
    }
}

impl Eq for KeyBlob {}
