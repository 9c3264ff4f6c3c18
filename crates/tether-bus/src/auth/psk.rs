//! `TETHER_SHARED_SECRET`: pre-shared secret challenge/response.
//!
//! Neither side ever sends the secret. Each proves possession through a
//! BLAKE3-PRF proof over both nonces under a side-specific label, and
//! the master secret is a third expansion of the same material:
//!
//! ```text
//! responder  ──  nonce_r                 ──▶  challenger
//! challenger ──  nonce_c ‖ proof_c       ──▶  responder
//! responder  ──  proof_r                 ──▶  challenger
//! ```

use crate::auth::mechanism::{AuthMechanism, AuthStep};
use crate::error::{BusError, BusResult};
use subtle::ConstantTimeEq;
use tether_crypto::keyblob::{KeyBlob, KeyBlobKind};
use tether_crypto::{prf, random};
use tracing::warn;
use zeroize::Zeroizing;

const MASTER_LABEL: &[u8] = b"master";
const CHALLENGER_PROOF_LABEL: &[u8] = b"challenger proof";
const RESPONDER_PROOF_LABEL: &[u8] = b"responder proof";

const NONCE_LEN: usize = 32;
/// nonce(32) ‖ proof(32)
const REPLY_LEN: usize = 64;
const PROOF_LEN: usize = 32;

/// Pre-shared secret authentication, non-interactive.
pub struct SharedSecretAuth {
    secret: Zeroizing<Vec<u8>>,
    local_nonce: Option<[u8; 32]>,
    expected_proof: Option<[u8; 32]>,
    master: Option<KeyBlob>,
    confirmed: bool,
}

impl SharedSecretAuth {
    /// Registered mechanism name.
    pub const NAME: &'static str = "TETHER_SHARED_SECRET";

    /// New instance over the given pre-shared secret.
    #[must_use]
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            local_nonce: None,
            expected_proof: None,
            master: None,
            confirmed: false,
        }
    }

    /// Expand (master, challenger proof, responder proof) from the
    /// secret and both nonces, responder's nonce first.
    fn derive(
        secret: &[u8],
        responder_nonce: &[u8],
        challenger_nonce: &[u8],
    ) -> ([u8; 32], [u8; 32], [u8; 32]) {
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(responder_nonce);
        seed.extend_from_slice(challenger_nonce);
        (
            prf::prf_key(secret, MASTER_LABEL, &seed),
            prf::prf_key(secret, CHALLENGER_PROOF_LABEL, &seed),
            prf::prf_key(secret, RESPONDER_PROOF_LABEL, &seed),
        )
    }
}

impl AuthMechanism for SharedSecretAuth {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_response(&mut self) -> BusResult<AuthStep> {
        if self.local_nonce.is_some() {
            return Ok(AuthStep::Fail);
        }
        let nonce = random::random_32()?;
        self.local_nonce = Some(nonce);
        Ok(AuthStep::Continue(nonce.to_vec()))
    }

    fn response(&mut self, challenge: &[u8]) -> BusResult<AuthStep> {
        let Some(local_nonce) = self.local_nonce else {
            return Ok(AuthStep::Fail);
        };
        if self.confirmed || challenge.len() != REPLY_LEN {
            warn!(len = challenge.len(), "unexpected shared-secret challenge");
            return Ok(AuthStep::Fail);
        }

        let (master, their_proof, our_proof) =
            Self::derive(&self.secret, &local_nonce, &challenge[..NONCE_LEN]);
        if !bool::from(their_proof[..].ct_eq(&challenge[NONCE_LEN..])) {
            warn!("shared-secret challenger proof mismatch");
            return Ok(AuthStep::Fail);
        }

        self.master =
            Some(KeyBlob::new(KeyBlobKind::Generic, master.to_vec()).with_tag(Self::NAME));
        self.confirmed = true;
        Ok(AuthStep::Complete(our_proof.to_vec()))
    }

    fn challenge(&mut self, response: &[u8]) -> BusResult<AuthStep> {
        if self.confirmed {
            return Ok(AuthStep::Fail);
        }
        if self.local_nonce.is_none() {
            // First round: the responder's nonce.
            if response.len() != NONCE_LEN {
                warn!(len = response.len(), "unexpected shared-secret opening");
                return Ok(AuthStep::Fail);
            }
            let local_nonce = random::random_32()?;
            let (master, our_proof, their_proof) =
                Self::derive(&self.secret, response, &local_nonce);

            self.master =
                Some(KeyBlob::new(KeyBlobKind::Generic, master.to_vec()).with_tag(Self::NAME));
            self.expected_proof = Some(their_proof);
            self.local_nonce = Some(local_nonce);

            let mut payload = Vec::with_capacity(REPLY_LEN);
            payload.extend_from_slice(&local_nonce);
            payload.extend_from_slice(&our_proof);
            return Ok(AuthStep::Continue(payload));
        }

        // Final round: the responder's proof.
        let Some(expected) = self.expected_proof.take() else {
            return Ok(AuthStep::Fail);
        };
        if response.len() != PROOF_LEN || !bool::from(expected[..].ct_eq(response)) {
            warn!("shared-secret responder proof mismatch");
            return Ok(AuthStep::Fail);
        }
        self.confirmed = true;
        Ok(AuthStep::Complete(Vec::new()))
    }

    fn master_secret(&self) -> BusResult<KeyBlob> {
        if !self.confirmed {
            return Err(BusError::key_unavailable("shared-secret exchange not complete"));
        }
        self.master
            .clone()
            .ok_or(BusError::key_unavailable("shared-secret exchange not complete"))
    }
}
