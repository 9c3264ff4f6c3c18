//! Typed messages over a single owned buffer.
//!
//! A [`Message`] owns its wire bytes end to end. The 16-byte envelope is
//! written in the sender's native byte order and tagged with it; a
//! receiver on the other order swaps scalars as it decodes. Header
//! fields and body live behind the envelope:
//!
//! ```text
//! offset 0            16                16+hdrLen   pad(8)       end
//!        ┌────────────┬─────────────────┬──────────┬─────────────┐
//!        │  envelope  │  header fields  │ padding  │    body     │
//!        └────────────┴─────────────────┴──────────┴─────────────┘
//! ```
//!
//! The envelope is fixed layout: endian tag, message type, flags,
//! protocol version, body length, serial, header length. `headerLen`
//! counts the field block without its trailing pad; `bodyLen` counts
//! body bytes and, once a body is sealed, the 16-byte tag after it.
//!
//! Compression and encryption are both buffer-in-place: compressing
//! swaps the compressible fields for a token at marshal time, and
//! sealing replaces the body bytes with ciphertext plus tag while the
//! envelope and field block double as associated data.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tether_crypto::aead::{AeadKey, Nonce, TAG_SIZE};

use crate::compression::CompressionTable;
use crate::error::WireError;
use crate::header::{HeaderFieldId, HeaderFields};
use crate::marshal::Writer;
use crate::signature;
use crate::unmarshal::Reader;
use crate::value::{is_valid_object_path, signature_of, Value};
use crate::{ENVELOPE_SIZE, MAX_PACKET_LEN, PROTOCOL_VERSION};

/// Kind of message, from the envelope's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Expects a method return or an error.
    MethodCall = 1,
    /// Successful reply to a method call.
    MethodReturn = 2,
    /// Error reply to a method call.
    Error = 3,
    /// One-way notification, unicast or broadcast.
    Signal = 4,
}

impl MessageType {
    /// Uppercase name used in log lines.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "METHOD_CALL",
            MessageType::MethodReturn => "METHOD_RET",
            MessageType::Error => "ERROR",
            MessageType::Signal => "SIGNAL",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, WireError> {
        match byte {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(WireError::InvalidMessageType(other)),
        }
    }
}

/// Message flags carried in envelope byte 2.
///
/// The auto-start bit is inverted on the wire: an envelope with the bit
/// clear means auto-start was requested. Conversion happens at the wire
/// boundary so in-memory flags always read positively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageFlags(u8);

impl MessageFlags {
    /// Sender wants no method return for this call.
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    /// Receiver may start the destination if it is not running.
    pub const AUTO_START: u8 = 0x02;
    /// Message may be routed off the local node.
    pub const ALLOW_REMOTE: u8 = 0x04;
    /// Signal fans out to every reachable node.
    pub const GLOBAL_BROADCAST: u8 = 0x20;
    /// Compressible header fields are replaced by a token.
    pub const COMPRESSED: u8 = 0x40;
    /// Body is sealed with an authenticated cipher.
    pub const ENCRYPTED: u8 = 0x80;

    const VALID_MASK: u8 = 0xE7;

    /// No flags set.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Build from raw bits, dropping undefined ones.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::VALID_MASK)
    }

    /// Raw in-memory bits.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub(crate) const fn to_wire(self) -> u8 {
        self.0 ^ Self::AUTO_START
    }

    pub(crate) const fn from_wire(bits: u8) -> Self {
        Self((bits ^ Self::AUTO_START) & Self::VALID_MASK)
    }

    /// Set the no-reply-expected flag.
    #[must_use]
    pub const fn with_no_reply_expected(self) -> Self {
        Self(self.0 | Self::NO_REPLY_EXPECTED)
    }

    /// Whether no reply is expected.
    #[must_use]
    pub const fn is_no_reply_expected(self) -> bool {
        self.0 & Self::NO_REPLY_EXPECTED != 0
    }

    /// Set the auto-start flag.
    #[must_use]
    pub const fn with_auto_start(self) -> Self {
        Self(self.0 | Self::AUTO_START)
    }

    /// Whether auto-start is requested.
    #[must_use]
    pub const fn is_auto_start(self) -> bool {
        self.0 & Self::AUTO_START != 0
    }

    /// Set the allow-remote flag.
    #[must_use]
    pub const fn with_allow_remote(self) -> Self {
        Self(self.0 | Self::ALLOW_REMOTE)
    }

    /// Whether off-node routing is allowed.
    #[must_use]
    pub const fn is_allow_remote(self) -> bool {
        self.0 & Self::ALLOW_REMOTE != 0
    }

    /// Set the global-broadcast flag.
    #[must_use]
    pub const fn with_global_broadcast(self) -> Self {
        Self(self.0 | Self::GLOBAL_BROADCAST)
    }

    /// Whether the signal fans out globally.
    #[must_use]
    pub const fn is_global_broadcast(self) -> bool {
        self.0 & Self::GLOBAL_BROADCAST != 0
    }

    /// Set the compressed flag.
    #[must_use]
    pub const fn with_compressed(self) -> Self {
        Self(self.0 | Self::COMPRESSED)
    }

    /// Whether header fields are compressed.
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Set the encrypted flag.
    #[must_use]
    pub const fn with_encrypted(self) -> Self {
        Self(self.0 | Self::ENCRYPTED)
    }

    /// Whether the body is sealed.
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }
}

const fn native_endian_tag() -> u8 {
    if cfg!(target_endian = "little") {
        b'l'
    } else {
        b'B'
    }
}

fn endian_swap(tag: u8) -> Result<bool, WireError> {
    match tag {
        b'l' => Ok(cfg!(target_endian = "big")),
        b'B' => Ok(cfg!(target_endian = "little")),
        other => Err(WireError::InvalidEndianTag(other)),
    }
}

fn envelope_u32(bytes: &[u8], swap: bool) -> u32 {
    // Callers slice exactly four bytes out of a checked envelope.
    let v = u32::from_ne_bytes(bytes.try_into().unwrap());
    if swap { v.swap_bytes() } else { v }
}

/// Milliseconds of wall clock, truncated to u32.
///
/// Timestamps wrap roughly every 49 days; comparisons use wrapping
/// subtraction.
#[must_use]
pub fn wall_clock_ms() -> u32 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    ms as u32
}

/// A complete message and its wire encoding.
#[derive(Debug, Clone)]
pub struct Message {
    buf: Vec<u8>,
    swap: bool,
    msg_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    body_offset: usize,
    fields: HeaderFields,
    pending_token: Option<u32>,
    body_sealed: bool,
}

impl Message {
    /// Total length a message will occupy, from its first bytes.
    ///
    /// Needs at least the 16-byte envelope. Stream readers call this to
    /// size the read for the rest of the message.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` below 16 bytes, envelope validation
    /// errors, and `WireError::BadLength` when the declared lengths
    /// exceed the packet bound.
    pub fn required_len(bytes: &[u8]) -> Result<usize, WireError> {
        if bytes.len() < ENVELOPE_SIZE {
            return Err(WireError::TooShort {
                expected: ENVELOPE_SIZE,
                actual: bytes.len(),
            });
        }
        let swap = endian_swap(bytes[0])?;
        MessageType::try_from(bytes[1])?;
        if bytes[3] != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(bytes[3]));
        }
        let body_len = envelope_u32(&bytes[4..8], swap) as usize;
        let header_len = envelope_u32(&bytes[12..16], swap) as usize;
        let total = ENVELOPE_SIZE + header_len.next_multiple_of(8) + body_len;
        if total > MAX_PACKET_LEN as usize {
            return Err(WireError::BadLength {
                what: "packet",
                len: u32::try_from(total).unwrap_or(u32::MAX),
                max: MAX_PACKET_LEN,
            });
        }
        Ok(total)
    }

    /// Decode a complete message from exactly its wire bytes.
    ///
    /// A compressed message whose token is missing from `table` still
    /// decodes; it parks the token and reports it through
    /// [`Message::needs_expansion`] until the expansion arrives.
    ///
    /// # Errors
    ///
    /// Envelope, header and length validation errors. The buffer must be
    /// exactly one message long.
    pub fn unmarshal(buf: Vec<u8>, table: &CompressionTable) -> Result<Self, WireError> {
        let total = Self::required_len(&buf)?;
        if buf.len() < total {
            return Err(WireError::TooShort {
                expected: total,
                actual: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(WireError::BadValue("trailing bytes after message".into()));
        }

        let swap = endian_swap(buf[0])?;
        let msg_type = MessageType::try_from(buf[1])?;
        let flags = MessageFlags::from_wire(buf[2]);
        let serial = envelope_u32(&buf[8..12], swap);
        if serial == 0 {
            return Err(WireError::BadValue("message serial is zero".into()));
        }
        let header_len = envelope_u32(&buf[12..16], swap) as usize;
        let body_offset = ENVELOPE_SIZE + header_len.next_multiple_of(8);

        let mut r = Reader::new_at(&buf, ENVELOPE_SIZE, ENVELOPE_SIZE + header_len, swap);
        let mut fields = HeaderFields::unmarshal(&mut r)?;

        let mut pending_token = None;
        if flags.is_compressed() {
            let token = fields
                .compression_token()
                .filter(|&t| t != 0)
                .ok_or(WireError::BadHeaderField(HeaderFieldId::CompressionToken as u8))?;
            match table.expand(token) {
                Some(expansion) => fields.merge(expansion),
                None => pending_token = Some(token),
            }
        }

        Ok(Self {
            buf,
            swap,
            msg_type,
            flags,
            serial,
            body_offset,
            fields,
            pending_token,
            body_sealed: flags.is_encrypted(),
        })
    }

    /// Message type.
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    /// Message flags, in-memory orientation.
    #[must_use]
    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Serial number, never zero.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Decoded header fields.
    ///
    /// While an expansion is outstanding the compressed-out fields are
    /// absent from this view.
    #[must_use]
    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    /// Rewrite the timestamp used for local expiry checks.
    pub fn set_timestamp(&mut self, timestamp_ms: u32) {
        self.fields.set_timestamp(timestamp_ms);
    }

    /// Complete wire encoding.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the message, returning its wire encoding.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Raw body bytes, ciphertext included when sealed.
    #[must_use]
    pub fn body_bytes(&self) -> &[u8] {
        &self.buf[self.body_offset..]
    }

    /// Compression token awaiting expansion, if any.
    #[must_use]
    pub fn needs_expansion(&self) -> Option<u32> {
        self.pending_token
    }

    /// Merge a received expansion and clear the pending token.
    pub fn finish_expansion(&mut self, expansion: HeaderFields) {
        self.fields.merge(expansion);
        self.pending_token = None;
    }

    /// Whether the body was sealed by the sender.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags.is_encrypted()
    }

    /// Whether this is a broadcast signal.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.msg_type == MessageType::Signal && self.fields.destination().is_none()
    }

    /// Whether the sender marked this message droppable via a nonzero
    /// time to live.
    #[must_use]
    pub fn is_unreliable(&self) -> bool {
        self.fields.time_to_live().is_some_and(|ttl| ttl != 0)
    }

    /// Whether a method return or error should come back.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.msg_type == MessageType::MethodCall && !self.flags.is_no_reply_expected()
    }

    /// Whether the message's time to live has elapsed at `now_ms`.
    ///
    /// Messages without a time to live, or with one of zero, never
    /// expire. Comparison wraps with the 49-day timestamp cycle.
    #[must_use]
    pub fn has_expired(&self, now_ms: u32) -> bool {
        let Some(ttl) = self.fields.time_to_live() else {
            return false;
        };
        if ttl == 0 {
            return false;
        }
        let Some(ts) = self.fields.timestamp() else {
            return false;
        };
        now_ms.wrapping_sub(ts) > u32::from(ttl)
    }

    /// Decode the body into typed values per the signature field.
    ///
    /// # Errors
    ///
    /// Returns `WireError::CannotExpand` while an expansion is
    /// outstanding, `WireError::EncryptedBody` while the body is sealed,
    /// and decode errors for a malformed body.
    pub fn body_values(&self) -> Result<Vec<Value>, WireError> {
        if let Some(token) = self.pending_token {
            return Err(WireError::CannotExpand { token });
        }
        if self.body_sealed {
            return Err(WireError::EncryptedBody);
        }
        let sig = self.fields.signature().unwrap_or("");
        let mut r = Reader::new_at(&self.buf, self.body_offset, self.buf.len(), self.swap);
        let mut values = Vec::new();
        let mut rest = sig;
        while !rest.is_empty() {
            let (first, tail) = signature::first_complete_type(rest)?;
            values.push(r.value(first)?);
            rest = tail;
        }
        if r.remaining() != 0 {
            return Err(WireError::BadValue(
                "body continues past its signature".into(),
            ));
        }
        Ok(values)
    }

    /// Decode the body after checking the signature field matches
    /// `expected`.
    ///
    /// # Errors
    ///
    /// Returns `WireError::UnexpectedSignature` on a mismatch, plus
    /// everything [`Message::body_values`] can return.
    pub fn body_values_expecting(&self, expected: &str) -> Result<Vec<Value>, WireError> {
        let actual = self.fields.signature().unwrap_or("");
        if actual != expected {
            return Err(WireError::UnexpectedSignature {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        self.body_values()
    }

    /// Milliseconds until expiry at `now_ms`, zero when already expired.
    ///
    /// `None` means the message never expires.
    #[must_use]
    pub fn expires_in(&self, now_ms: u32) -> Option<u32> {
        let ttl = self.fields.time_to_live().filter(|&t| t != 0)?;
        let ts = self.fields.timestamp()?;
        let elapsed = now_ms.wrapping_sub(ts);
        Some(u32::from(ttl).saturating_sub(elapsed))
    }

    /// Seal the body in place.
    ///
    /// The envelope and field block become associated data, so any
    /// header tamper fails the eventual open. The wire body length grows
    /// by the 16-byte tag before sealing so both sides authenticate the
    /// same envelope.
    ///
    /// # Errors
    ///
    /// Returns `WireError::EncryptedBody` if already sealed,
    /// `WireError::BadLength` if the tag would push the message over the
    /// packet bound, and crypto failures from the cipher.
    pub fn encrypt_body(&mut self, key: &AeadKey, base_nonce: &[u8]) -> Result<(), WireError> {
        if self.body_sealed || self.flags.is_encrypted() {
            return Err(WireError::EncryptedBody);
        }
        let sealed_len = self.buf.len() + TAG_SIZE;
        if sealed_len > MAX_PACKET_LEN as usize {
            return Err(WireError::BadLength {
                what: "packet",
                len: u32::try_from(sealed_len).unwrap_or(u32::MAX),
                max: MAX_PACKET_LEN,
            });
        }

        self.flags = self.flags.with_encrypted();
        self.buf[2] = self.flags.to_wire();
        let wire_body_len = (self.buf.len() - self.body_offset + TAG_SIZE) as u32;
        self.patch_body_len(wire_body_len);

        let nonce = self.message_nonce(base_nonce)?;
        let sealed = key.encrypt(
            &nonce,
            &self.buf[self.body_offset..],
            &self.buf[..self.body_offset],
        )?;
        self.buf.truncate(self.body_offset);
        self.buf.extend_from_slice(&sealed);
        self.body_sealed = true;
        Ok(())
    }

    /// Open a sealed body in place.
    ///
    /// # Errors
    ///
    /// Returns `WireError::CannotExpand` while an expansion is
    /// outstanding, `WireError::NotEncrypted` for a plaintext body, and
    /// `WireError::Crypto` when authentication fails.
    pub fn decrypt_body(&mut self, key: &AeadKey, base_nonce: &[u8]) -> Result<(), WireError> {
        if let Some(token) = self.pending_token {
            return Err(WireError::CannotExpand { token });
        }
        if !self.body_sealed {
            return Err(WireError::NotEncrypted);
        }
        let body = &self.buf[self.body_offset..];
        if body.len() < TAG_SIZE {
            return Err(WireError::TooShort {
                expected: TAG_SIZE,
                actual: body.len(),
            });
        }

        let nonce = self.message_nonce(base_nonce)?;
        let plain = key.decrypt(&nonce, body, &self.buf[..self.body_offset])?;
        self.buf.truncate(self.body_offset);
        self.buf.extend_from_slice(&plain);
        self.patch_body_len((self.buf.len() - self.body_offset) as u32);
        self.body_sealed = false;
        Ok(())
    }

    fn message_nonce(&self, base_nonce: &[u8]) -> Result<Nonce, WireError> {
        let hash = self
            .flags
            .is_compressed()
            .then(|| self.fields.compute_hash());
        Ok(Nonce::for_message(base_nonce, self.serial, hash.as_ref())?)
    }

    fn patch_body_len(&mut self, len: u32) {
        let len = if self.swap { len.swap_bytes() } else { len };
        self.buf[4..8].copy_from_slice(&len.to_ne_bytes());
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.msg_type.as_str(), self.serial)?;
        match self.msg_type {
            MessageType::MethodCall | MessageType::Signal => {
                if let (Some(iface), Some(member)) =
                    (self.fields.interface(), self.fields.member())
                {
                    write!(f, " {iface}.{member}")?;
                }
            }
            MessageType::MethodReturn => {
                if let Some(rs) = self.fields.reply_serial() {
                    write!(f, " reply to {rs}")?;
                }
            }
            MessageType::Error => {
                if let Some(name) = self.fields.error_name() {
                    write!(f, " {name}")?;
                }
            }
        }
        Ok(())
    }
}

/// Builder for outbound messages.
///
/// Setters collect the pieces; [`MessageBuilder::build`] validates them
/// against the message type and produces the wire encoding in one pass.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    msg_type: MessageType,
    flags: MessageFlags,
    serial: u32,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    reply_serial: Option<u32>,
    session_id: Option<u32>,
    ttl_ms: Option<u16>,
    timestamp_ms: Option<u32>,
    body: Vec<Value>,
}

impl MessageBuilder {
    /// Start a message of the given type.
    #[must_use]
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            flags: MessageFlags::new(),
            serial: 0,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            reply_serial: None,
            session_id: None,
            ttl_ms: None,
            timestamp_ms: None,
            body: Vec::new(),
        }
    }

    /// Start a method return answering `call`.
    ///
    /// Presets the reply serial, the destination from the call's sender,
    /// and the session id.
    #[must_use]
    pub fn method_return(call: &Message) -> Self {
        let mut b = Self::new(MessageType::MethodReturn);
        b.reply_serial = Some(call.serial());
        b.destination = call.fields().sender().map(String::from);
        b.session_id = call.fields().session_id();
        b
    }

    /// Start an error reply answering `call`.
    #[must_use]
    pub fn error_reply(call: &Message, error_name: impl Into<String>) -> Self {
        let mut b = Self::method_return(call);
        b.msg_type = MessageType::Error;
        b.error_name = Some(error_name.into());
        b
    }

    /// Set the message flags.
    #[must_use]
    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the serial number. Required and nonzero.
    #[must_use]
    pub fn serial(mut self, serial: u32) -> Self {
        self.serial = serial;
        self
    }

    /// Set the object path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the interface name.
    #[must_use]
    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Set the member name.
    #[must_use]
    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Set the error name.
    #[must_use]
    pub fn error_name(mut self, name: impl Into<String>) -> Self {
        self.error_name = Some(name.into());
        self
    }

    /// Set the destination name.
    #[must_use]
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Set the sender name.
    #[must_use]
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Set the serial being replied to.
    #[must_use]
    pub fn reply_serial(mut self, serial: u32) -> Self {
        self.reply_serial = Some(serial);
        self
    }

    /// Set the session id.
    #[must_use]
    pub fn session_id(mut self, session_id: u32) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set the time to live in milliseconds. Zero behaves like unset.
    #[must_use]
    pub fn ttl_ms(mut self, ttl_ms: u16) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// Override the timestamp instead of sampling the clock.
    #[must_use]
    pub fn timestamp_ms(mut self, timestamp_ms: u32) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Set the body values.
    #[must_use]
    pub fn body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }

    /// Validate, marshal and return the finished message.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BadValue` for a zero serial or fields missing
    /// for the message type, signature and marshal errors for the body,
    /// and `WireError::BadLength` past the packet bound.
    pub fn build(self, table: &CompressionTable) -> Result<Message, WireError> {
        if self.serial == 0 {
            return Err(WireError::BadValue("message serial must be nonzero".into()));
        }
        match self.msg_type {
            MessageType::MethodCall | MessageType::Signal => {
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() {
                    return Err(WireError::BadValue(format!(
                        "{} requires path, interface and member",
                        self.msg_type.as_str()
                    )));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(WireError::BadValue(
                        "method return requires a reply serial".into(),
                    ));
                }
            }
            MessageType::Error => {
                if self.error_name.is_none() || self.reply_serial.is_none() {
                    return Err(WireError::BadValue(
                        "error reply requires an error name and a reply serial".into(),
                    ));
                }
            }
        }

        let mut fields = HeaderFields::new();
        if let Some(path) = self.path {
            if !is_valid_object_path(&path) {
                return Err(WireError::BadValue(format!("object path \"{path}\"")));
            }
            fields.set(HeaderFieldId::Path, Value::ObjectPath(path))?;
        }
        if let Some(v) = self.interface {
            fields.set(HeaderFieldId::Interface, Value::String(v))?;
        }
        if let Some(v) = self.member {
            fields.set(HeaderFieldId::Member, Value::String(v))?;
        }
        if let Some(v) = self.error_name {
            fields.set(HeaderFieldId::ErrorName, Value::String(v))?;
        }
        if let Some(v) = self.destination {
            fields.set(HeaderFieldId::Destination, Value::String(v))?;
        }
        if let Some(v) = self.sender {
            fields.set(HeaderFieldId::Sender, Value::String(v))?;
        }
        if let Some(v) = self.reply_serial {
            fields.set(HeaderFieldId::ReplySerial, Value::Uint32(v))?;
        }
        if let Some(v) = self.session_id {
            fields.set(HeaderFieldId::SessionId, Value::Uint32(v))?;
        }
        if let Some(ttl) = self.ttl_ms {
            if ttl != 0 {
                fields.set(HeaderFieldId::TimeToLive, Value::Uint16(ttl))?;
                let ts = self.timestamp_ms.unwrap_or_else(wall_clock_ms);
                fields.set(HeaderFieldId::Timestamp, Value::Uint32(ts))?;
            }
        }
        if !self.body.is_empty() {
            let sig = signature_of(&self.body);
            signature::validate(&sig)?;
            fields.set(HeaderFieldId::Signature, Value::Signature(sig))?;
        }

        // Compression rewrites the wire form only; the logical field
        // view keeps every field plus the allocated token.
        let wire_fields_owned;
        let wire_fields = if self.flags.is_compressed() {
            let mut compressed = fields.clone();
            let taken = compressed.take_compressible();
            let token = table.compress(&taken)?;
            compressed.set(HeaderFieldId::CompressionToken, Value::Uint32(token))?;
            fields.set(HeaderFieldId::CompressionToken, Value::Uint32(token))?;
            wire_fields_owned = compressed;
            &wire_fields_owned
        } else {
            &fields
        };

        let mut w = Writer::with_capacity(256);
        w.u8(native_endian_tag());
        w.u8(self.msg_type as u8);
        w.u8(self.flags.to_wire());
        w.u8(PROTOCOL_VERSION);
        let body_len_pos = w.reserve_u32();
        w.u32(self.serial);
        let header_len_pos = w.reserve_u32();

        wire_fields.marshal(&mut w)?;
        let header_len = (w.len() - ENVELOPE_SIZE) as u32;
        w.patch_u32(header_len_pos, header_len);

        w.pad(8);
        let body_offset = w.len();
        for value in &self.body {
            w.value(value)?;
        }
        let body_len = (w.len() - body_offset) as u32;
        w.patch_u32(body_len_pos, body_len);

        if w.len() > MAX_PACKET_LEN as usize {
            return Err(WireError::BadLength {
                what: "packet",
                len: u32::try_from(w.len()).unwrap_or(u32::MAX),
                max: MAX_PACKET_LEN,
            });
        }

        Ok(Message {
            buf: w.into_inner(),
            swap: false,
            msg_type: self.msg_type,
            flags: self.flags,
            serial: self.serial,
            body_offset,
            fields,
            pending_token: None,
            body_sealed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CompressionTable {
        CompressionTable::new()
    }

    fn ping_signal(serial: u32) -> MessageBuilder {
        MessageBuilder::new(MessageType::Signal)
            .serial(serial)
            .path("/org/tether/Test")
            .interface("org.tether.Test")
            .member("Ping")
    }

    fn test_key() -> AeadKey {
        AeadKey::new([7u8; 32])
    }

    const BASE_NONCE: [u8; 24] = [0x42; 24];

    #[test]
    fn test_envelope_layout() {
        let msg = ping_signal(7).build(&table()).unwrap();
        let buf = msg.bytes();

        assert_eq!(buf[0], native_endian_tag());
        assert_eq!(buf[1], MessageType::Signal as u8);
        assert_eq!(buf[3], PROTOCOL_VERSION);

        let body_len = envelope_u32(&buf[4..8], false);
        let serial = envelope_u32(&buf[8..12], false);
        let header_len = envelope_u32(&buf[12..16], false) as usize;
        assert_eq!(body_len, 0);
        assert_eq!(serial, 7);
        assert_eq!(
            buf.len(),
            ENVELOPE_SIZE + header_len.next_multiple_of(8)
        );
        assert_eq!(Message::required_len(buf).unwrap(), buf.len());
    }

    #[test]
    fn test_auto_start_bit_is_inverted_on_wire() {
        let plain = ping_signal(1).build(&table()).unwrap();
        assert_eq!(plain.bytes()[2] & MessageFlags::AUTO_START, MessageFlags::AUTO_START);
        assert!(!plain.flags().is_auto_start());

        let auto = ping_signal(2)
            .flags(MessageFlags::new().with_auto_start())
            .build(&table())
            .unwrap();
        assert_eq!(auto.bytes()[2] & MessageFlags::AUTO_START, 0);
        assert!(auto.flags().is_auto_start());

        let decoded = Message::unmarshal(auto.into_bytes(), &table()).unwrap();
        assert!(decoded.flags().is_auto_start());
    }

    #[test]
    fn test_method_call_roundtrip_with_body() {
        let t = table();
        let body = vec![
            Value::String("hello".into()),
            Value::Uint32(99),
            Value::Array {
                elem_sig: "y".into(),
                elems: vec![Value::Byte(1), Value::Byte(2), Value::Byte(3)],
            },
        ];
        let msg = MessageBuilder::new(MessageType::MethodCall)
            .serial(41)
            .path("/org/tether/Bus/Peer")
            .interface("org.tether.Bus.Peer")
            .member("ExchangeGuids")
            .destination(":1.7")
            .sender(":1.1")
            .session_id(12)
            .body(body.clone())
            .build(&t)
            .unwrap();

        let decoded = Message::unmarshal(msg.into_bytes(), &t).unwrap();
        assert_eq!(decoded.msg_type(), MessageType::MethodCall);
        assert_eq!(decoded.serial(), 41);
        assert_eq!(decoded.fields().member(), Some("ExchangeGuids"));
        assert_eq!(decoded.fields().signature(), Some("suay"));
        assert_eq!(decoded.body_values().unwrap(), body);
        assert!(decoded.expects_reply());
        assert!(!decoded.is_broadcast());
    }

    #[test]
    fn test_build_validation() {
        let t = table();
        assert!(matches!(
            MessageBuilder::new(MessageType::Signal)
                .path("/p")
                .interface("i.f")
                .member("M")
                .build(&t),
            Err(WireError::BadValue(_))
        ));
        assert!(matches!(
            MessageBuilder::new(MessageType::Signal).serial(1).build(&t),
            Err(WireError::BadValue(_))
        ));
        assert!(matches!(
            MessageBuilder::new(MessageType::MethodReturn).serial(1).build(&t),
            Err(WireError::BadValue(_))
        ));
        assert!(matches!(
            ping_signal(1).path("no/leading/slash").build(&t),
            Err(WireError::BadValue(_))
        ));
    }

    #[test]
    fn test_reply_builders_preset_fields() {
        let t = table();
        let call = MessageBuilder::new(MessageType::MethodCall)
            .serial(5)
            .path("/org/tether/Bus/Peer")
            .interface("org.tether.Bus.Peer")
            .member("AuthChallenge")
            .sender(":1.2")
            .session_id(3)
            .build(&t)
            .unwrap();

        let ret = MessageBuilder::method_return(&call)
            .serial(6)
            .body(vec![Value::String("ok".into())])
            .build(&t)
            .unwrap();
        assert_eq!(ret.fields().reply_serial(), Some(5));
        assert_eq!(ret.fields().destination(), Some(":1.2"));
        assert_eq!(ret.fields().session_id(), Some(3));

        let err = MessageBuilder::error_reply(&call, "org.tether.Bus.ErStatus")
            .serial(7)
            .build(&t)
            .unwrap();
        assert_eq!(err.msg_type(), MessageType::Error);
        assert_eq!(err.fields().error_name(), Some("org.tether.Bus.ErStatus"));
        assert_eq!(err.fields().reply_serial(), Some(5));
    }

    #[test]
    fn test_compressed_roundtrip_through_shared_table() {
        let shared = table();
        let msg = ping_signal(9)
            .flags(MessageFlags::new().with_compressed())
            .session_id(44)
            .build(&shared)
            .unwrap();
        assert!(msg.fields().compression_token().is_some());

        let decoded = Message::unmarshal(msg.into_bytes(), &shared).unwrap();
        assert_eq!(decoded.needs_expansion(), None);
        assert_eq!(decoded.fields().member(), Some("Ping"));
        assert_eq!(decoded.fields().session_id(), Some(44));
        assert!(decoded.body_values().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_token_defers_expansion() {
        let sender_table = table();
        let msg = ping_signal(10)
            .flags(MessageFlags::new().with_compressed())
            .build(&sender_table)
            .unwrap();
        let token = msg.fields().compression_token().unwrap();
        let mut logical = msg.fields().clone();
        let expansion = logical.take_compressible();

        let receiver_table = table();
        let mut decoded = Message::unmarshal(msg.into_bytes(), &receiver_table).unwrap();
        assert_eq!(decoded.needs_expansion(), Some(token));
        assert_eq!(decoded.fields().member(), None);
        assert!(matches!(
            decoded.body_values(),
            Err(WireError::CannotExpand { token: t }) if t == token
        ));

        decoded.finish_expansion(expansion);
        assert_eq!(decoded.needs_expansion(), None);
        assert_eq!(decoded.fields().member(), Some("Ping"));
        assert!(decoded.body_values().unwrap().is_empty());
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let t = table();
        let key = test_key();
        let body = vec![Value::String("secret".into())];
        let mut msg = ping_signal(21).body(body.clone()).build(&t).unwrap();

        msg.encrypt_body(&key, &BASE_NONCE).unwrap();
        assert!(msg.flags().is_encrypted());
        let wire = msg.into_bytes();

        let mut decoded = Message::unmarshal(wire, &t).unwrap();
        assert!(decoded.is_encrypted());
        assert!(matches!(decoded.body_values(), Err(WireError::EncryptedBody)));

        decoded.decrypt_body(&key, &BASE_NONCE).unwrap();
        assert_eq!(decoded.body_values().unwrap(), body);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let t = table();
        let mut msg = ping_signal(22)
            .body(vec![Value::Uint32(5)])
            .build(&t)
            .unwrap();
        msg.encrypt_body(&test_key(), &BASE_NONCE).unwrap();

        let mut decoded = Message::unmarshal(msg.into_bytes(), &t).unwrap();
        let wrong = AeadKey::new([8u8; 32]);
        assert!(matches!(
            decoded.decrypt_body(&wrong, &BASE_NONCE),
            Err(WireError::Crypto(_))
        ));
    }

    #[test]
    fn test_header_tamper_fails_decrypt() {
        let t = table();
        let key = test_key();
        let mut msg = ping_signal(23)
            .session_id(1)
            .body(vec![Value::Uint32(5)])
            .build(&t)
            .unwrap();
        msg.encrypt_body(&key, &BASE_NONCE).unwrap();

        let mut wire = msg.into_bytes();
        // Flip a letter inside the path string so the header still
        // parses but no longer matches the authenticated bytes.
        wire[ENVELOPE_SIZE + 9] ^= 0x01;
        let mut decoded = Message::unmarshal(wire, &t).unwrap();
        assert!(matches!(
            decoded.decrypt_body(&key, &BASE_NONCE),
            Err(WireError::Crypto(_))
        ));
    }

    #[test]
    fn test_double_encrypt_rejected() {
        let t = table();
        let key = test_key();
        let mut msg = ping_signal(24).build(&t).unwrap();
        msg.encrypt_body(&key, &BASE_NONCE).unwrap();
        assert!(matches!(
            msg.encrypt_body(&key, &BASE_NONCE),
            Err(WireError::EncryptedBody)
        ));
    }

    #[test]
    fn test_decrypt_plaintext_rejected() {
        let t = table();
        let mut msg = ping_signal(25).build(&t).unwrap();
        assert!(matches!(
            msg.decrypt_body(&test_key(), &BASE_NONCE),
            Err(WireError::NotEncrypted)
        ));
    }

    #[test]
    fn test_compressed_and_encrypted_roundtrip() {
        let shared = table();
        let key = test_key();
        let mut msg = ping_signal(31)
            .flags(MessageFlags::new().with_compressed())
            .body(vec![Value::Uint32(77)])
            .build(&shared)
            .unwrap();
        msg.encrypt_body(&key, &BASE_NONCE).unwrap();

        let mut decoded = Message::unmarshal(msg.into_bytes(), &shared).unwrap();
        decoded.decrypt_body(&key, &BASE_NONCE).unwrap();
        assert_eq!(decoded.body_values().unwrap(), vec![Value::Uint32(77)]);
    }

    #[test]
    fn test_encrypted_with_unknown_token_defers_decrypt() {
        let sender_table = table();
        let key = test_key();
        let mut msg = ping_signal(32)
            .flags(MessageFlags::new().with_compressed())
            .body(vec![Value::Uint32(1)])
            .build(&sender_table)
            .unwrap();
        let token = msg.fields().compression_token().unwrap();
        let mut logical = msg.fields().clone();
        let expansion = logical.take_compressible();
        msg.encrypt_body(&key, &BASE_NONCE).unwrap();

        let receiver_table = table();
        let mut decoded = Message::unmarshal(msg.into_bytes(), &receiver_table).unwrap();
        assert!(matches!(
            decoded.decrypt_body(&key, &BASE_NONCE),
            Err(WireError::CannotExpand { .. })
        ));

        receiver_table.add_expansion(token, expansion.clone());
        decoded.finish_expansion(expansion);
        decoded.decrypt_body(&key, &BASE_NONCE).unwrap();
        assert_eq!(decoded.body_values().unwrap(), vec![Value::Uint32(1)]);
    }

    #[test]
    fn test_typed_body_checks_signature() {
        let t = table();
        let msg = ping_signal(55)
            .body(vec![Value::String("g".into()), Value::Uint32(4)])
            .build(&t)
            .unwrap();
        assert!(msg.body_values_expecting("su").is_ok());
        assert!(matches!(
            msg.body_values_expecting("uu"),
            Err(WireError::UnexpectedSignature { .. })
        ));
    }

    #[test]
    fn test_expiry() {
        let t = table();
        let fresh = ping_signal(51)
            .ttl_ms(100)
            .timestamp_ms(1_000)
            .build(&t)
            .unwrap();
        assert!(!fresh.has_expired(1_050));
        assert!(!fresh.has_expired(1_100));
        assert!(fresh.has_expired(1_101));
        assert!(fresh.is_unreliable());
        assert_eq!(fresh.expires_in(1_050), Some(50));
        assert_eq!(fresh.expires_in(1_200), Some(0));
        assert_eq!(ping_signal(54).build(&t).unwrap().expires_in(1_000), None);

        // Wrapped clock: timestamp near u32::MAX, now past zero.
        let wrapped = ping_signal(52)
            .ttl_ms(100)
            .timestamp_ms(u32::MAX - 10)
            .build(&t)
            .unwrap();
        assert!(!wrapped.has_expired(50));
        assert!(wrapped.has_expired(200));

        let forever = ping_signal(53).build(&t).unwrap();
        assert!(!forever.has_expired(u32::MAX));
        assert!(!forever.is_unreliable());
    }

    #[test]
    fn test_required_len_reads_foreign_byte_order() {
        // Hand-built big-endian envelope: header 20 bytes, body 4.
        let mut envelope = vec![b'B', 4, 2, PROTOCOL_VERSION];
        envelope.extend_from_slice(&4u32.to_be_bytes());
        envelope.extend_from_slice(&9u32.to_be_bytes());
        envelope.extend_from_slice(&20u32.to_be_bytes());

        let total = Message::required_len(&envelope).unwrap();
        assert_eq!(total, 16 + 24 + 4);
    }

    #[test]
    fn test_bad_envelopes_rejected() {
        let good = ping_signal(1).build(&table()).unwrap().into_bytes();

        let mut bad_tag = good.clone();
        bad_tag[0] = b'x';
        assert!(matches!(
            Message::required_len(&bad_tag),
            Err(WireError::InvalidEndianTag(b'x'))
        ));

        let mut bad_type = good.clone();
        bad_type[1] = 0;
        assert!(matches!(
            Message::required_len(&bad_type),
            Err(WireError::InvalidMessageType(0))
        ));

        let mut bad_version = good.clone();
        bad_version[3] = 9;
        assert!(matches!(
            Message::required_len(&bad_version),
            Err(WireError::UnsupportedVersion(9))
        ));

        assert!(matches!(
            Message::required_len(&good[..8]),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let t = table();
        let wire = ping_signal(1)
            .body(vec![Value::Uint32(1)])
            .build(&t)
            .unwrap()
            .into_bytes();
        let short = wire[..wire.len() - 2].to_vec();
        assert!(matches!(
            Message::unmarshal(short, &t),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut envelope = vec![native_endian_tag(), 4, 2, PROTOCOL_VERSION];
        envelope.extend_from_slice(&(MAX_PACKET_LEN + 1).to_ne_bytes());
        envelope.extend_from_slice(&1u32.to_ne_bytes());
        envelope.extend_from_slice(&0u32.to_ne_bytes());
        assert!(matches!(
            Message::required_len(&envelope),
            Err(WireError::BadLength { what: "packet", .. })
        ));
    }

    #[test]
    fn test_display_formats() {
        let t = table();
        let call = MessageBuilder::new(MessageType::MethodCall)
            .serial(5)
            .path("/org/tether/Bus/Peer")
            .interface("org.tether.Bus.Peer")
            .member("Ping")
            .build(&t)
            .unwrap();
        assert_eq!(call.to_string(), "METHOD_CALL[5] org.tether.Bus.Peer.Ping");

        let err = MessageBuilder::error_reply(&call, "org.tether.Bus.ErTimeout")
            .serial(6)
            .build(&t)
            .unwrap();
        assert_eq!(err.to_string(), "ERROR[6] org.tether.Bus.ErTimeout");
    }
}
