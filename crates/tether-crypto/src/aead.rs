//! `XChaCha20-Poly1305` AEAD for message bodies.
//!
//! Messages are encrypted body-only: the marshaled header bytes ride along
//! as associated data so tampering with either half fails authentication.
//! Features:
//! - 256-bit keys, 192-bit nonces, 128-bit tags
//! - Per-message nonce derivation from the peer's stored base nonce
//!
//! ## Nonce derivation
//!
//! The base nonce agreed during session-key negotiation is XORed with the
//! message serial number and, for header-compressed messages, with a hash of
//! the compressible fields. The serial guarantees uniqueness within one
//! session; the field hash stops an attacker from forcing nonce reuse by
//! answering an expansion request with a bogus rule.

use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit},
};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

use crate::CryptoError;
use crate::keyblob::KeyBlob;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() != NONCE_SIZE {
            return None;
        }
        let mut bytes = [0u8; NONCE_SIZE];
        bytes.copy_from_slice(slice);
        Some(Self(bytes))
    }

    /// Generate a random nonce.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the nonce for one message.
    ///
    /// `base` is the 24-byte nonce stored alongside the session or group
    /// key. The serial is XORed in little-endian at offset 0; when the
    /// message was header-compressed, the 32-byte compressible-field hash
    /// contributes its first 24 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] if `base` is not 24 bytes.
    pub fn for_message(
        base: &[u8],
        serial: u32,
        field_hash: Option<&[u8; 32]>,
    ) -> Result<Self, CryptoError> {
        let mut bytes: [u8; NONCE_SIZE] = base
            .try_into()
            .map_err(|_| CryptoError::InvalidNonceLength)?;
        for (dst, src) in bytes.iter_mut().zip(serial.to_le_bytes()) {
            *dst ^= src;
        }
        if let Some(hash) = field_hash {
            for (dst, src) in bytes.iter_mut().zip(hash.iter()) {
                *dst ^= src;
            }
        }
        Ok(Self(bytes))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Get as a reference for chacha20poly1305.
    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

impl Default for Nonce {
    fn default() -> Self {
        Self([0u8; NONCE_SIZE])
    }
}

/// AEAD encryption key (32 bytes).
///
/// Wraps the raw key material and provides encryption/decryption methods.
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Borrow the key material out of a key blob.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the blob is not 32 bytes.
    pub fn from_blob(blob: &KeyBlob) -> Result<Self, CryptoError> {
        Self::from_slice(blob.as_bytes())
    }

    /// Generate a random key.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag (`plaintext.len()` + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .encrypt(
                nonce.as_generic(),
                chacha20poly1305::aead::Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data.
    ///
    /// Input must include the authentication tag at the end.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(
                nonce.as_generic(),
                chacha20poly1305::aead::Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
