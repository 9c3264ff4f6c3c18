//! BLAKE3-keyed pseudorandom function.
//!
//! One PRF serves both key-derivation jobs in the bus:
//! - expanding a master secret plus fresh public nonces into session key
//!   matter (key, nonce, verifier), and
//! - letting authentication mechanisms turn shared secrets into master
//!   secrets and confirmation proofs.
//!
//! The construction is keyed BLAKE3 over `label || seed` with the secret
//! hashed down to the 32-byte key position, read out through the XOF.

use subtle::ConstantTimeEq;

use crate::error::CryptoError;
use crate::keyblob::{KeyBlob, KeyBlobKind};
use crate::{AEAD_KEY_SIZE, AEAD_NONCE_SIZE, VERIFIER_SIZE};

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute the BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Fill `output` with PRF bytes derived from `secret`, `label`, and `seed`.
///
/// Deterministic: the same inputs always produce the same output, which is
/// what lets two peers independently derive identical session matter.
pub fn prf(secret: &[u8], label: &[u8], seed: &[u8], output: &mut [u8]) {
    let key = hash(secret);
    let mut hasher = blake3::Hasher::new_keyed(&key);
    hasher.update(label);
    hasher.update(seed);
    hasher.finalize_xof().fill(output);
}

/// Derive a single 32-byte key.
#[must_use]
pub fn prf_key(secret: &[u8], label: &[u8], seed: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    prf(secret, label, seed, &mut out);
    out
}

/// Session key matter expanded from a master secret.
///
/// The layout mirrors the negotiation protocol: both sides feed the same
/// master secret and nonce seed through [`derive_session_matter`] and end up
/// with the same key, nonce, and verifier. The verifier travels over the
/// wire; the key and nonce never do.
pub struct SessionMatter {
    /// AEAD session key.
    pub key: KeyBlob,
    /// Base nonce the per-message nonce derivation starts from.
    pub nonce: KeyBlob,
    /// Hex confirmation string proving both sides derived the same matter.
    pub verifier: String,
}

/// PRF label for session-key expansion.
const SESSION_KEY_LABEL: &[u8] = b"session key";

/// Expand `master` plus a public `seed` into session key matter.
///
/// `seed` is the concatenation of the two 28-byte nonces the peers
/// exchanged; the caller tags the resulting key with the mechanism name
/// carried on the master secret.
///
/// # Errors
///
/// Returns [`CryptoError::KeyUnavailable`] when the master secret is empty
/// or expired.
pub fn derive_session_matter(master: &KeyBlob, seed: &[u8]) -> Result<SessionMatter, CryptoError> {
    if !master.is_valid() {
        return Err(CryptoError::KeyUnavailable);
    }
    let mut matter = [0u8; AEAD_KEY_SIZE + AEAD_NONCE_SIZE + VERIFIER_SIZE];
    prf(master.as_bytes(), SESSION_KEY_LABEL, seed, &mut matter);

    let key = KeyBlob::new(KeyBlobKind::Aead, matter[..AEAD_KEY_SIZE].to_vec())
        .with_tag(master.tag());
    let nonce = KeyBlob::new(
        KeyBlobKind::Nonce,
        matter[AEAD_KEY_SIZE..AEAD_KEY_SIZE + AEAD_NONCE_SIZE].to_vec(),
    );
    let verifier = hex::encode(&matter[AEAD_KEY_SIZE + AEAD_NONCE_SIZE..]);
    Ok(SessionMatter { key, nonce, verifier })
}

/// Constant-time comparison of two verifier strings.
#[must_use]
pub fn verifiers_match(ours: &str, theirs: &str) -> bool {
    ours.as_bytes().ct_eq(theirs.as_bytes()).into()
}
