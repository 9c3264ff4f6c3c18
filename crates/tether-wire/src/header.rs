//! Message header fields.
//!
//! Every field rides the wire as an 8-aligned `[tag: u8][variant]` pair.
//! Unknown tags are skipped on decode so older nodes can talk to newer
//! ones.
//!
//! ## Field tags
//!
//! | Tag | Field             | Type        | Compressible |
//! |-----|-------------------|-------------|--------------|
//! | 1   | Path              | object path | yes          |
//! | 2   | Interface         | string      | yes          |
//! | 3   | Member            | string      | yes          |
//! | 4   | ErrorName         | string      | no           |
//! | 5   | ReplySerial       | u32         | no           |
//! | 6   | Destination       | string      | yes          |
//! | 7   | Sender            | string      | yes          |
//! | 8   | Signature         | signature   | yes          |
//! | 9   | Handles           | u32         | no           |
//! | 16  | Timestamp         | u32         | no           |
//! | 17  | TimeToLive        | u16         | yes          |
//! | 18  | CompressionToken  | u32         | no           |
//! | 19  | SessionId         | u32         | yes          |
//!
//! Compressible fields can be swapped out for a single `CompressionToken`
//! field. The exact canonical encoding of the removed fields keys the
//! token table; a looser digest of the same fields feeds per-message
//! nonces.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::WireError;
use crate::marshal::Writer;
use crate::signature;
use crate::types::TypeId;
use crate::unmarshal::Reader;
use crate::value::Value;

/// Wire tag of a header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HeaderFieldId {
    /// Object path the message is addressed to.
    Path = 1,
    /// Interface name.
    Interface = 2,
    /// Member (method or signal) name.
    Member = 3,
    /// Error name carried by error replies.
    ErrorName = 4,
    /// Serial of the call this message replies to.
    ReplySerial = 5,
    /// Unique or well-known name of the destination.
    Destination = 6,
    /// Unique name of the sender.
    Sender = 7,
    /// Signature of the message body.
    Signature = 8,
    /// Number of attached handles.
    Handles = 9,
    /// Sender-side timestamp in milliseconds.
    Timestamp = 16,
    /// Time to live in milliseconds; zero means the message never expires.
    TimeToLive = 17,
    /// Token standing in for the compressed-out fields.
    CompressionToken = 18,
    /// Session the message belongs to.
    SessionId = 19,
}

impl HeaderFieldId {
    /// Compressible fields in tag order.
    pub const COMPRESSIBLE: [HeaderFieldId; 8] = [
        HeaderFieldId::Path,
        HeaderFieldId::Interface,
        HeaderFieldId::Member,
        HeaderFieldId::Destination,
        HeaderFieldId::Sender,
        HeaderFieldId::Signature,
        HeaderFieldId::TimeToLive,
        HeaderFieldId::SessionId,
    ];

    /// The value type this field must carry.
    #[must_use]
    pub const fn expected_type(self) -> TypeId {
        match self {
            HeaderFieldId::Path => TypeId::ObjectPath,
            HeaderFieldId::Interface
            | HeaderFieldId::Member
            | HeaderFieldId::ErrorName
            | HeaderFieldId::Destination
            | HeaderFieldId::Sender => TypeId::String,
            HeaderFieldId::Signature => TypeId::Signature,
            HeaderFieldId::ReplySerial
            | HeaderFieldId::Handles
            | HeaderFieldId::Timestamp
            | HeaderFieldId::CompressionToken
            | HeaderFieldId::SessionId => TypeId::Uint32,
            HeaderFieldId::TimeToLive => TypeId::Uint16,
        }
    }

    /// Whether this field may be replaced by a compression token.
    #[must_use]
    pub const fn is_compressible(self) -> bool {
        matches!(
            self,
            HeaderFieldId::Path
                | HeaderFieldId::Interface
                | HeaderFieldId::Member
                | HeaderFieldId::Destination
                | HeaderFieldId::Sender
                | HeaderFieldId::Signature
                | HeaderFieldId::TimeToLive
                | HeaderFieldId::SessionId
        )
    }
}

impl TryFrom<u8> for HeaderFieldId {
    type Error = WireError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(HeaderFieldId::Path),
            2 => Ok(HeaderFieldId::Interface),
            3 => Ok(HeaderFieldId::Member),
            4 => Ok(HeaderFieldId::ErrorName),
            5 => Ok(HeaderFieldId::ReplySerial),
            6 => Ok(HeaderFieldId::Destination),
            7 => Ok(HeaderFieldId::Sender),
            8 => Ok(HeaderFieldId::Signature),
            9 => Ok(HeaderFieldId::Handles),
            16 => Ok(HeaderFieldId::Timestamp),
            17 => Ok(HeaderFieldId::TimeToLive),
            18 => Ok(HeaderFieldId::CompressionToken),
            19 => Ok(HeaderFieldId::SessionId),
            other => Err(WireError::BadHeaderField(other)),
        }
    }
}

/// Typed header field map, iterated in tag order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderFields {
    fields: BTreeMap<HeaderFieldId, Value>,
}

impl HeaderFields {
    /// Create an empty field map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of fields present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no fields are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether `id` is present.
    #[must_use]
    pub fn contains(&self, id: HeaderFieldId) -> bool {
        self.fields.contains_key(&id)
    }

    /// Get a field value.
    #[must_use]
    pub fn get(&self, id: HeaderFieldId) -> Option<&Value> {
        self.fields.get(&id)
    }

    /// Set a field, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BadHeaderField` if the value type does not
    /// match the field's wire type.
    pub fn set(&mut self, id: HeaderFieldId, value: Value) -> Result<(), WireError> {
        if value.type_id() != id.expected_type() {
            return Err(WireError::BadHeaderField(id as u8));
        }
        self.fields.insert(id, value);
        Ok(())
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, id: HeaderFieldId) -> Option<Value> {
        self.fields.remove(&id)
    }

    /// Iterate fields in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (HeaderFieldId, &Value)> {
        self.fields.iter().map(|(id, v)| (*id, v))
    }

    fn get_str(&self, id: HeaderFieldId) -> Option<&str> {
        self.fields.get(&id).and_then(Value::as_str)
    }

    fn get_u32(&self, id: HeaderFieldId) -> Option<u32> {
        self.fields.get(&id).and_then(Value::as_u32)
    }

    /// Object path, if present.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.get_str(HeaderFieldId::Path)
    }

    /// Interface name, if present.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        self.get_str(HeaderFieldId::Interface)
    }

    /// Member name, if present.
    #[must_use]
    pub fn member(&self) -> Option<&str> {
        self.get_str(HeaderFieldId::Member)
    }

    /// Error name, if present.
    #[must_use]
    pub fn error_name(&self) -> Option<&str> {
        self.get_str(HeaderFieldId::ErrorName)
    }

    /// Destination name, if present.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.get_str(HeaderFieldId::Destination)
    }

    /// Sender name, if present.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.get_str(HeaderFieldId::Sender)
    }

    /// Body signature, if present.
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        self.get_str(HeaderFieldId::Signature)
    }

    /// Serial this message replies to, if present.
    #[must_use]
    pub fn reply_serial(&self) -> Option<u32> {
        self.get_u32(HeaderFieldId::ReplySerial)
    }

    /// Sender timestamp in milliseconds, if present.
    #[must_use]
    pub fn timestamp(&self) -> Option<u32> {
        self.get_u32(HeaderFieldId::Timestamp)
    }

    /// Time to live in milliseconds, if present.
    #[must_use]
    pub fn time_to_live(&self) -> Option<u16> {
        self.fields
            .get(&HeaderFieldId::TimeToLive)
            .and_then(Value::as_u16)
    }

    /// Compression token, if present.
    #[must_use]
    pub fn compression_token(&self) -> Option<u32> {
        self.get_u32(HeaderFieldId::CompressionToken)
    }

    /// Session id, if present.
    #[must_use]
    pub fn session_id(&self) -> Option<u32> {
        self.get_u32(HeaderFieldId::SessionId)
    }

    /// Overwrite the timestamp field.
    ///
    /// Receivers adjust timestamps into their own clock domain before
    /// expiry checks; this touches only the decoded field map, never the
    /// wire encoding.
    pub fn set_timestamp(&mut self, timestamp_ms: u32) {
        self.fields
            .insert(HeaderFieldId::Timestamp, Value::Uint32(timestamp_ms));
    }

    /// Marshal all fields, each 8-aligned, with no trailing padding.
    ///
    /// # Errors
    ///
    /// Propagates marshal failures from oversized values.
    pub fn marshal(&self, w: &mut Writer) -> Result<(), WireError> {
        for (id, value) in &self.fields {
            w.pad(8);
            w.u8(*id as u8);
            w.signature(&value.signature());
            w.value(value)?;
        }
        Ok(())
    }

    /// Unmarshal fields until the reader's limit.
    ///
    /// Unknown tags are parsed and dropped. A known tag carrying the
    /// wrong value type fails the whole block.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BadHeaderField` on a type mismatch and decode
    /// errors from the underlying reader.
    pub fn unmarshal(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let mut fields = BTreeMap::new();
        while r.remaining() > 0 {
            r.align(8)?;
            if r.remaining() == 0 {
                break;
            }
            let tag = r.u8()?;
            let sig = r.signature()?.to_string();
            if signature::count_complete_types(&sig)? != 1 {
                return Err(WireError::BadSignature(format!(
                    "header field signature \"{sig}\" is not one complete type"
                )));
            }
            let value = r.value(&sig)?;
            match HeaderFieldId::try_from(tag) {
                Ok(id) => {
                    if value.type_id() != id.expected_type() {
                        return Err(WireError::BadHeaderField(tag));
                    }
                    fields.insert(id, value);
                }
                Err(_) => {
                    trace!(tag, "ignoring unknown header field");
                }
            }
        }
        Ok(Self { fields })
    }

    /// Remove and return the compressible fields.
    #[must_use]
    pub fn take_compressible(&mut self) -> HeaderFields {
        let mut taken = BTreeMap::new();
        for id in HeaderFieldId::COMPRESSIBLE {
            if let Some(v) = self.fields.remove(&id) {
                taken.insert(id, v);
            }
        }
        Self { fields: taken }
    }

    /// Fill in fields from `expansion` without touching fields already
    /// present.
    pub fn merge(&mut self, expansion: HeaderFields) {
        for (id, value) in expansion.fields {
            self.fields.entry(id).or_insert(value);
        }
    }

    fn encode_compressible(&self, include_ttl_value: bool) -> Vec<u8> {
        let mut out = Vec::new();
        for id in HeaderFieldId::COMPRESSIBLE {
            let Some(value) = self.fields.get(&id) else {
                continue;
            };
            out.push(id as u8);
            out.push(id.expected_type() as u8);
            match value {
                Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => {
                    out.extend_from_slice(s.as_bytes());
                }
                Value::Uint32(v) => out.extend_from_slice(&v.to_le_bytes()),
                Value::Uint16(v) if include_ttl_value => {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                _ => {}
            }
        }
        out
    }

    /// Exact byte encoding of the compressible fields present, in tag
    /// order. Two field sets share a compression token only when their
    /// canonical bytes are equal.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.encode_compressible(true)
    }

    /// BLAKE3 digest of the compressible fields, folded into per-message
    /// nonces. The time-to-live field contributes only its tag and type,
    /// so the digest is stable across messages that differ in nothing
    /// but their expiry.
    #[must_use]
    pub fn compute_hash(&self) -> [u8; 32] {
        tether_crypto::prf::hash(&self.encode_compressible(false))
    }

    /// Convert to an `a(yv)` value for expansion replies.
    #[must_use]
    pub fn to_expansion_value(&self) -> Value {
        let elems = self
            .fields
            .iter()
            .map(|(id, v)| {
                Value::Struct(vec![Value::Byte(*id as u8), Value::Variant(Box::new(v.clone()))])
            })
            .collect();
        Value::Array {
            elem_sig: "(yv)".to_string(),
            elems,
        }
    }

    /// Rebuild a field map from an `a(yv)` expansion value.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BadValue` on a malformed array and
    /// `WireError::BadHeaderField` on an unknown tag or a type mismatch.
    pub fn from_expansion_value(value: &Value) -> Result<Self, WireError> {
        let Value::Array { elem_sig, elems } = value else {
            return Err(WireError::BadValue("expansion is not an array".into()));
        };
        if elem_sig != "(yv)" {
            return Err(WireError::BadValue(format!(
                "expansion element signature \"{elem_sig}\""
            )));
        }
        let mut fields = Self::new();
        for elem in elems {
            let Value::Struct(pair) = elem else {
                return Err(WireError::BadValue("expansion element is not a struct".into()));
            };
            let [Value::Byte(tag), Value::Variant(inner)] = pair.as_slice() else {
                return Err(WireError::BadValue("expansion element is not (yv)".into()));
            };
            let id = HeaderFieldId::try_from(*tag)?;
            fields.set(id, (**inner).clone())?;
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> HeaderFields {
        let mut f = HeaderFields::new();
        f.set(HeaderFieldId::Path, Value::ObjectPath("/org/tether/Bus/Peer".into()))
            .unwrap();
        f.set(HeaderFieldId::Interface, Value::String("org.tether.Bus.Peer".into()))
            .unwrap();
        f.set(HeaderFieldId::Member, Value::String("ExchangeGuids".into()))
            .unwrap();
        f.set(HeaderFieldId::Signature, Value::Signature("su".into()))
            .unwrap();
        f.set(HeaderFieldId::SessionId, Value::Uint32(77)).unwrap();
        f.set(HeaderFieldId::TimeToLive, Value::Uint16(500)).unwrap();
        f.set(HeaderFieldId::ReplySerial, Value::Uint32(12)).unwrap();
        f
    }

    #[test]
    fn test_field_block_roundtrip() {
        let fields = sample_fields();
        let mut w = Writer::new();
        fields.marshal(&mut w).unwrap();
        let buf = w.into_inner();

        let mut r = Reader::new(&buf, false);
        let decoded = HeaderFields::unmarshal(&mut r).unwrap();
        assert_eq!(decoded, fields);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_set_rejects_wrong_type() {
        let mut f = HeaderFields::new();
        let err = f
            .set(HeaderFieldId::Path, Value::String("/not/a/path/value".into()))
            .unwrap_err();
        assert!(matches!(err, WireError::BadHeaderField(1)));
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let mut w = Writer::new();
        w.pad(8);
        w.u8(200);
        w.signature("u");
        w.u32(9);
        w.pad(8);
        w.u8(HeaderFieldId::SessionId as u8);
        w.signature("u");
        w.u32(4);
        let buf = w.into_inner();

        let mut r = Reader::new(&buf, false);
        let decoded = HeaderFields::unmarshal(&mut r).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.session_id(), Some(4));
    }

    #[test]
    fn test_known_tag_with_wrong_type_fails() {
        let mut w = Writer::new();
        w.pad(8);
        w.u8(HeaderFieldId::Path as u8);
        w.signature("u");
        w.u32(1);
        let buf = w.into_inner();

        let mut r = Reader::new(&buf, false);
        let err = HeaderFields::unmarshal(&mut r).unwrap_err();
        assert!(matches!(err, WireError::BadHeaderField(1)));
    }

    #[test]
    fn test_canonical_bytes_layout() {
        let mut f = HeaderFields::new();
        f.set(HeaderFieldId::Member, Value::String("Ping".into()))
            .unwrap();
        f.set(HeaderFieldId::SessionId, Value::Uint32(0x0102_0304))
            .unwrap();

        let bytes = f.canonical_bytes();
        let mut expected = vec![3, b's'];
        expected.extend_from_slice(b"Ping");
        expected.extend_from_slice(&[19, b'u']);
        expected.extend_from_slice(&0x0102_0304u32.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_ttl_value_perturbs_canonical_bytes_but_not_hash() {
        let mut a = HeaderFields::new();
        a.set(HeaderFieldId::Member, Value::String("Ping".into()))
            .unwrap();
        a.set(HeaderFieldId::TimeToLive, Value::Uint16(100)).unwrap();

        let mut b = HeaderFields::new();
        b.set(HeaderFieldId::Member, Value::String("Ping".into()))
            .unwrap();
        b.set(HeaderFieldId::TimeToLive, Value::Uint16(9000)).unwrap();

        assert_ne!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.compute_hash(), b.compute_hash());

        let mut c = HeaderFields::new();
        c.set(HeaderFieldId::Member, Value::String("Pong".into()))
            .unwrap();
        c.set(HeaderFieldId::TimeToLive, Value::Uint16(100)).unwrap();
        assert_ne!(a.compute_hash(), c.compute_hash());
    }

    #[test]
    fn test_non_compressible_fields_do_not_hash() {
        let mut a = HeaderFields::new();
        a.set(HeaderFieldId::Member, Value::String("Ping".into()))
            .unwrap();

        let mut b = a.clone();
        b.set(HeaderFieldId::ReplySerial, Value::Uint32(55)).unwrap();
        b.set(HeaderFieldId::Timestamp, Value::Uint32(123_456)).unwrap();

        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_take_compressible_splits_fields() {
        let mut f = sample_fields();
        let compressed = f.take_compressible();

        assert!(compressed.contains(HeaderFieldId::Path));
        assert!(compressed.contains(HeaderFieldId::TimeToLive));
        assert!(!f.contains(HeaderFieldId::Path));
        assert_eq!(f.reply_serial(), Some(12));

        f.merge(compressed);
        assert_eq!(f, sample_fields());
    }

    #[test]
    fn test_expansion_value_roundtrip() {
        let mut f = sample_fields();
        let compressed = f.take_compressible();
        let value = compressed.to_expansion_value();
        let back = HeaderFields::from_expansion_value(&value).unwrap();
        assert_eq!(back, compressed);
    }

    #[test]
    fn test_expansion_value_rejects_unknown_tag() {
        let value = Value::Array {
            elem_sig: "(yv)".into(),
            elems: vec![Value::Struct(vec![
                Value::Byte(250),
                Value::Variant(Box::new(Value::Uint32(1))),
            ])],
        };
        assert!(matches!(
            HeaderFields::from_expansion_value(&value),
            Err(WireError::BadHeaderField(250))
        ));
    }
}
