//! `TETHER_KEYX_ECDH`: ephemeral x25519 key exchange.
//!
//! Both sides contribute an ephemeral public key and a 32-byte nonce:
//!
//! ```text
//! responder  ──  pub_r ‖ nonce_r                      ──▶  challenger
//! challenger ──  pub_c ‖ nonce_c ‖ confirm_c          ──▶  responder
//! responder  ──  confirm_r                            ──▶  challenger
//! ```
//!
//! The master secret and both confirmation values are BLAKE3-PRF
//! expansions of the shared point over the concatenated nonces, under
//! distinct labels. Each side proves possession of the shared secret
//! through its confirmation value before the exchange completes.

use crate::auth::mechanism::{AuthMechanism, AuthStep};
use crate::error::{BusError, BusResult};
use subtle::ConstantTimeEq;
use tether_crypto::keyblob::{KeyBlob, KeyBlobKind};
use tether_crypto::{prf, random};
use tracing::warn;
use x25519_dalek::{PublicKey, StaticSecret};

const MASTER_LABEL: &[u8] = b"ecdh master secret";
const CHALLENGER_CONFIRM_LABEL: &[u8] = b"ecdh challenger confirm";
const RESPONDER_CONFIRM_LABEL: &[u8] = b"ecdh responder confirm";

/// pub(32) ‖ nonce(32)
const OPEN_LEN: usize = 64;
/// pub(32) ‖ nonce(32) ‖ confirm(32)
const REPLY_LEN: usize = 96;
const CONFIRM_LEN: usize = 32;

/// Ephemeral x25519 key exchange, non-interactive.
pub struct EcdhKeyExchange {
    secret: Option<StaticSecret>,
    local_nonce: Option<[u8; 32]>,
    expected_confirm: Option<[u8; 32]>,
    master: Option<KeyBlob>,
    confirmed: bool,
}

impl EcdhKeyExchange {
    /// Registered mechanism name.
    pub const NAME: &'static str = "TETHER_KEYX_ECDH";

    /// Fresh exchange with no key material yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            secret: None,
            local_nonce: None,
            expected_confirm: None,
            master: None,
            confirmed: false,
        }
    }

    /// Expand (master, challenger confirm, responder confirm) from the
    /// shared point and both nonces, responder's nonce first.
    fn derive(
        shared: &[u8; 32],
        responder_nonce: &[u8],
        challenger_nonce: &[u8],
    ) -> ([u8; 32], [u8; 32], [u8; 32]) {
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(responder_nonce);
        seed.extend_from_slice(challenger_nonce);
        (
            prf::prf_key(shared, MASTER_LABEL, &seed),
            prf::prf_key(shared, CHALLENGER_CONFIRM_LABEL, &seed),
            prf::prf_key(shared, RESPONDER_CONFIRM_LABEL, &seed),
        )
    }
}

impl Default for EcdhKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthMechanism for EcdhKeyExchange {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initial_response(&mut self) -> BusResult<AuthStep> {
        if self.secret.is_some() {
            return Ok(AuthStep::Fail);
        }
        let secret = StaticSecret::from(random::random_32()?);
        let public = PublicKey::from(&secret);
        let nonce = random::random_32()?;

        let mut payload = Vec::with_capacity(OPEN_LEN);
        payload.extend_from_slice(public.as_bytes());
        payload.extend_from_slice(&nonce);
        self.secret = Some(secret);
        self.local_nonce = Some(nonce);
        Ok(AuthStep::Continue(payload))
    }

    fn response(&mut self, challenge: &[u8]) -> BusResult<AuthStep> {
        let (Some(secret), Some(local_nonce)) = (&self.secret, &self.local_nonce) else {
            return Ok(AuthStep::Fail);
        };
        if self.confirmed || challenge.len() != REPLY_LEN {
            warn!(len = challenge.len(), "unexpected ecdh challenge payload");
            return Ok(AuthStep::Fail);
        }

        // Length checked above.
        let their_pub: [u8; 32] = challenge[..32].try_into().unwrap();
        let shared = secret.diffie_hellman(&PublicKey::from(their_pub));
        if shared.as_bytes() == &[0u8; 32] {
            warn!("rejecting low-order ecdh public key");
            return Ok(AuthStep::Fail);
        }

        let (master, their_confirm, our_confirm) =
            Self::derive(shared.as_bytes(), local_nonce, &challenge[32..64]);
        if !bool::from(their_confirm[..].ct_eq(&challenge[64..96])) {
            warn!("ecdh challenger confirmation mismatch");
            return Ok(AuthStep::Fail);
        }

        self.master =
            Some(KeyBlob::new(KeyBlobKind::Generic, master.to_vec()).with_tag(Self::NAME));
        self.confirmed = true;
        Ok(AuthStep::Complete(our_confirm.to_vec()))
    }

    fn challenge(&mut self, response: &[u8]) -> BusResult<AuthStep> {
        if self.confirmed {
            return Ok(AuthStep::Fail);
        }
        if self.secret.is_none() {
            // First round: the responder's opening payload.
            if response.len() != OPEN_LEN {
                warn!(len = response.len(), "unexpected ecdh opening payload");
                return Ok(AuthStep::Fail);
            }
            let secret = StaticSecret::from(random::random_32()?);
            let public = PublicKey::from(&secret);
            let local_nonce = random::random_32()?;

            // Length checked above.
            let their_pub: [u8; 32] = response[..32].try_into().unwrap();
            let shared = secret.diffie_hellman(&PublicKey::from(their_pub));
            if shared.as_bytes() == &[0u8; 32] {
                warn!("rejecting low-order ecdh public key");
                return Ok(AuthStep::Fail);
            }

            let (master, our_confirm, their_confirm) =
                Self::derive(shared.as_bytes(), &response[32..64], &local_nonce);
            self.master =
                Some(KeyBlob::new(KeyBlobKind::Generic, master.to_vec()).with_tag(Self::NAME));
            self.expected_confirm = Some(their_confirm);
            self.secret = Some(secret);

            let mut payload = Vec::with_capacity(REPLY_LEN);
            payload.extend_from_slice(public.as_bytes());
            payload.extend_from_slice(&local_nonce);
            payload.extend_from_slice(&our_confirm);
            return Ok(AuthStep::Continue(payload));
        }

        // Final round: the responder's confirmation value.
        let Some(expected) = self.expected_confirm.take() else {
            return Ok(AuthStep::Fail);
        };
        if response.len() != CONFIRM_LEN || !bool::from(expected[..].ct_eq(response)) {
            warn!("ecdh responder confirmation mismatch");
            return Ok(AuthStep::Fail);
        }
        self.confirmed = true;
        Ok(AuthStep::Complete(Vec::new()))
    }

    fn master_secret(&self) -> BusResult<KeyBlob> {
        if !self.confirmed {
            return Err(BusError::key_unavailable("ecdh exchange not complete"));
        }
        self.master
            .clone()
            .ok_or(BusError::key_unavailable("ecdh exchange not complete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_exchange() -> (EcdhKeyExchange, EcdhKeyExchange) {
        let mut responder = EcdhKeyExchange::new();
        let mut challenger = EcdhKeyExchange::new();

        let AuthStep::Continue(open) = responder.initial_response().unwrap() else {
            panic!("expected opening payload");
        };
        let AuthStep::Continue(reply) = challenger.challenge(&open).unwrap() else {
            panic!("expected challenger reply");
        };
        let AuthStep::Complete(confirm) = responder.response(&reply).unwrap() else {
            panic!("expected responder confirmation");
        };
        let AuthStep::Complete(rest) = challenger.challenge(&confirm).unwrap() else {
            panic!("expected challenger completion");
        };
        assert!(rest.is_empty());
        (responder, challenger)
    }

    #[test]
    fn test_exchange_end_to_end() {
        let (responder, challenger) = run_exchange();
        let a = responder.master_secret().unwrap();
        let b = challenger.master_secret().unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.tag(), EcdhKeyExchange::NAME);
        assert_eq!(a.kind(), KeyBlobKind::Generic);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_master_unavailable_before_completion() {
        let mut responder = EcdhKeyExchange::new();
        assert!(responder.master_secret().is_err());
        responder.initial_response().unwrap();
        assert!(responder.master_secret().is_err());
    }

    #[test]
    fn test_two_exchanges_differ() {
        let (a, _) = run_exchange();
        let (b, _) = run_exchange();
        assert_ne!(
            a.master_secret().unwrap().as_bytes(),
            b.master_secret().unwrap().as_bytes()
        );
    }

    #[test]
    fn test_low_order_public_key_rejected() {
        let mut challenger = EcdhKeyExchange::new();
        let mut open = vec![0u8; 64];
        open[32..].copy_from_slice(&[7u8; 32]);
        assert!(matches!(
            challenger.challenge(&open).unwrap(),
            AuthStep::Fail
        ));
    }

    #[test]
    fn test_tampered_confirmation_fails() {
        let mut responder = EcdhKeyExchange::new();
        let mut challenger = EcdhKeyExchange::new();

        let AuthStep::Continue(open) = responder.initial_response().unwrap() else {
            panic!("expected opening payload");
        };
        let AuthStep::Continue(reply) = challenger.challenge(&open).unwrap() else {
            panic!("expected challenger reply");
        };
        let AuthStep::Complete(mut confirm) = responder.response(&reply).unwrap() else {
            panic!("expected responder confirmation");
        };
        confirm[0] ^= 0x01;
        assert!(matches!(
            challenger.challenge(&confirm).unwrap(),
            AuthStep::Fail
        ));
        assert!(challenger.master_secret().is_err());
    }

    #[test]
    fn test_truncated_payloads_fail() {
        let mut challenger = EcdhKeyExchange::new();
        assert!(matches!(
            challenger.challenge(&[0u8; 16]).unwrap(),
            AuthStep::Fail
        ));

        let mut responder = EcdhKeyExchange::new();
        responder.initial_response().unwrap();
        assert!(matches!(responder.response(&[0u8; 95]).unwrap(), AuthStep::Fail));
    }

    #[test]
    fn test_response_before_initial_fails() {
        let mut responder = EcdhKeyExchange::new();
        assert!(matches!(
            responder.response(&[0u8; 96]).unwrap(),
            AuthStep::Fail
        ));
    }
}
