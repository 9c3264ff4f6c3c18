//! # TETHER Wire
//!
//! Wire codec for the TETHER bus protocol: typed message bodies, the
//! 16-byte message envelope, header-field marshal/unmarshal, and the
//! header compression table.
//!
//! ## Message Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ Envelope (16 bytes)                                              │
//! │   endian tag │ type │ flags │ version │ bodyLen │ serial │ hdrLen│
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Header fields (hdrLen bytes)                                     │
//! │   each field 8-aligned: tag byte, then variant-coded value       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Body (bodyLen bytes, 8-aligned start)                            │
//! │   arguments marshaled per the header signature field             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Messages are marshaled in native byte order; the envelope's endian tag
//! lets the receiving side byte-swap during decode. When a message is
//! flagged compressed, its compressible header fields travel as a single
//! u32 token resolved against a [`compression::CompressionTable`]. When
//! flagged encrypted, the marshaled body is sealed in place with the
//! header bytes as associated data.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod compression;
pub mod error;
pub mod header;
pub mod marshal;
pub mod message;
pub mod signature;
pub mod types;
pub mod unmarshal;
pub mod value;

pub use compression::CompressionTable;
pub use error::WireError;
pub use header::{HeaderFieldId, HeaderFields};
pub use message::{Message, MessageBuilder, MessageFlags, MessageType};
pub use types::TypeId;
pub use value::Value;

/// Wire protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed message envelope size in bytes.
pub const ENVELOPE_SIZE: usize = 16;

/// Upper bound on a complete marshaled message.
pub const MAX_PACKET_LEN: u32 = 131_072;

/// Upper bound on a marshaled array's byte length.
pub const MAX_ARRAY_LEN: u32 = 131_072;

/// Maximum nesting depth for arrays and for structs, counted separately.
pub const MAX_NESTING_DEPTH: usize = 32;
