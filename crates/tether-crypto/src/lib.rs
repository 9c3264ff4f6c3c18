//! # TETHER Crypto
//!
//! Cryptographic core for the TETHER bus.
//!
//! This crate provides:
//! - Tagged, expiring key blobs with zeroization
//! - BLAKE3-keyed PRF for session-key and verifier derivation
//! - `XChaCha20-Poly1305` AEAD for message bodies (header as AAD)
//! - Password-protected persistent key store (Argon2id + XChaCha20-Poly1305)
//! - Peer and store GUIDs
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | PRF/KDF | keyed BLAKE3 | 128-bit |
//! | Store Key Derivation | Argon2id | 256-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod guid;
pub mod keyblob;
pub mod keystore;
pub mod prf;
pub mod random;

pub use error::CryptoError;
pub use guid::Guid;
pub use keyblob::{KeyBlob, KeyBlobKind};
pub use keystore::{KeyDerivationParams, KeyStore, KeyStoreState};

/// XChaCha20-Poly1305 key size
pub const AEAD_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const AEAD_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size appended to encrypted bodies
pub const AEAD_TAG_SIZE: usize = 16;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;

/// GUID size in bytes
pub const GUID_SIZE: usize = 16;

/// Verifier length (bytes of PRF output rendered as hex)
pub const VERIFIER_SIZE: usize = 12;
