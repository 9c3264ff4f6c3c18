//! Error types for the TETHER wire codec.

use thiserror::Error;

/// Wire-level errors.
///
/// Every variant is local to a single message: a failed decode rejects that
/// message and nothing else. Callers decide separately whether a structural
/// failure also tears down the connection that produced it.
#[derive(Debug, Error)]
pub enum WireError {
    /// Buffer ended before a declared length was satisfied
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size available
        actual: usize,
    },

    /// A declared length exceeds its bound
    #[error("{what} length {len} exceeds bound {max}")]
    BadLength {
        /// What carried the oversized length
        what: &'static str,
        /// Declared length
        len: u32,
        /// Permitted maximum
        max: u32,
    },

    /// String or object path without a terminating NUL, or with an embedded one
    #[error("string is not NUL terminated")]
    NotNulTerminated,

    /// A value failed structural validation
    #[error("bad value: {0}")]
    BadValue(String),

    /// Malformed or over-deep type signature
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// Body signature disagrees with the declared one
    #[error("unexpected signature: expected \"{expected}\", got \"{actual}\"")]
    UnexpectedSignature {
        /// Signature the header declares
        expected: String,
        /// Signature computed from the body
        actual: String,
    },

    /// Envelope endian tag is neither `l` nor `B`
    #[error("invalid endian tag: 0x{0:02X}")]
    InvalidEndianTag(u8),

    /// Envelope message type byte is out of range
    #[error("invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    /// Envelope carries a protocol version this codec does not speak
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Unknown type id byte in a signature or variant
    #[error("invalid type id: 0x{0:02X}")]
    InvalidTypeId(u8),

    /// A header field is malformed or carries the wrong type
    #[error("bad header field: tag {0}")]
    BadHeaderField(u8),

    /// Compression token not present in the local table
    #[error("cannot expand compression token {token}")]
    CannotExpand {
        /// The unknown token
        token: u32,
    },

    /// Body is still ciphertext; decrypt before decoding arguments
    #[error("message body is encrypted")]
    EncryptedBody,

    /// Decrypt was requested for a message that was never encrypted
    #[error("message body is not encrypted")]
    NotEncrypted,

    /// Cryptographic failure while sealing or opening a body
    #[error("crypto error: {0}")]
    Crypto(#[from] tether_crypto::CryptoError),
}
