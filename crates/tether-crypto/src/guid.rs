//! Bus participant identity.
//!
//! A GUID is a stable 128-bit identifier for a bus participant, distinct
//! from any transient network address or bus name the participant may hold.
//! The key store also carries one GUID identifying the store itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::random;

/// Stable 128-bit participant identifier.
///
/// Rendered as 32 lowercase hex characters; an 8-character short form is
/// available for log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid([u8; 16]);

impl Guid {
    /// The all-zero GUID, used as a placeholder before identity exchange.
    pub const EMPTY: Guid = Guid([0u8; 16]);

    /// Create a GUID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random GUID.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; 16];
        random::fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Raw byte representation.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True for the all-zero placeholder GUID.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// First 8 hex characters, for compact log output.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Guid {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidGuid(e.to_string()))?;
        let bytes: [u8; 16] = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidGuid(format!("expected 16 bytes, got {} chars", s.len())))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_roundtrip_via_string() {
        let guid = Guid::random().unwrap();
        let text = guid.to_string();
        assert_eq!(text.len(), 32);
        let parsed: Guid = text.parse().unwrap();
        assert_eq!(parsed, guid);
    }

    #[test]
    fn test_guid_rejects_bad_text() {
        assert!("not-hex".parse::<Guid>().is_err());
        assert!("aabb".parse::<Guid>().is_err());
    }

    #[test]
    fn test_empty_guid() {
        assert!(Guid::EMPTY.is_empty());
        assert!(!Guid::random().unwrap().is_empty());
    }

    #[test]
    fn test_short_form() {
        let guid = Guid::from_bytes([0xab; 16]);
        assert_eq!(guid.short(), "abababab");
    }
}
