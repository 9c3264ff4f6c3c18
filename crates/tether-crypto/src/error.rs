//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid nonce length
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// No key material available for the requested peer or kind
    #[error("key unavailable")]
    KeyUnavailable,

    /// Key store has not been loaded
    #[error("key store not loaded")]
    StoreNotLoaded,

    /// Key store version tag does not match
    #[error("key store version mismatch: expected {expected:#06x}, got {actual:#06x}")]
    StoreVersionMismatch {
        /// Version this implementation writes
        expected: u16,
        /// Version found in the source
        actual: u16,
    },

    /// Key store contents failed structural validation
    #[error("corrupt key store: {0}")]
    CorruptStore(String),

    /// Writing the key store to its sink failed
    #[error("key store write failed: {0}")]
    StoreWrite(String),

    /// Reading the key store from its source failed
    #[error("key store read failed: {0}")]
    StoreRead(String),

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Invalid GUID encoding
    #[error("invalid GUID: {0}")]
    InvalidGuid(String),

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,
}
