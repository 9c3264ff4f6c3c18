//! Alignment-aware marshaling into one owned, growable buffer.
//!
//! All multi-byte scalars are written in native byte order; the envelope's
//! endian tag tells the receiving side whether to swap. Alignment is always
//! relative to the start of the buffer, which is also the start of the
//! message.

use crate::error::WireError;
use crate::types::TypeId;
use crate::value::Value;
use crate::{MAX_ARRAY_LEN, MAX_NESTING_DEPTH};

/// Marshaling writer owning the message buffer being built.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the finished buffer.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Borrow the bytes written so far.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Zero-fill up to the next multiple of `alignment`.
    pub fn pad(&mut self, alignment: usize) {
        let rem = self.buf.len() % alignment;
        if rem != 0 {
            self.buf.resize(self.buf.len() + alignment - rem, 0);
        }
    }

    /// Write one byte.
    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Write an aligned u16.
    pub fn u16(&mut self, v: u16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write an aligned i16.
    pub fn i16(&mut self, v: i16) {
        self.pad(2);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write an aligned u32.
    pub fn u32(&mut self, v: u32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write an aligned i32.
    pub fn i32(&mut self, v: i32) {
        self.pad(4);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write an aligned u64.
    pub fn u64(&mut self, v: u64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write an aligned i64.
    pub fn i64(&mut self, v: i64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write an aligned f64.
    pub fn f64(&mut self, v: f64) {
        self.pad(8);
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Write raw bytes with no alignment or length prefix.
    pub fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a u32-length-prefixed, NUL-terminated string.
    pub fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Write a u8-length-prefixed, NUL-terminated signature.
    pub fn signature(&mut self, sig: &str) {
        self.u8(sig.len() as u8);
        self.buf.extend_from_slice(sig.as_bytes());
        self.buf.push(0);
    }

    /// Reserve an aligned u32 slot for later patching.
    ///
    /// Returns the slot's byte offset.
    pub fn reserve_u32(&mut self) -> usize {
        self.pad(4);
        let pos = self.buf.len();
        self.buf.extend_from_slice(&0u32.to_ne_bytes());
        pos
    }

    /// Patch a previously reserved u32 slot.
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        self.buf[pos..pos + 4].copy_from_slice(&v.to_ne_bytes());
    }

    /// Marshal one typed value at its natural alignment.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BadLength` when an array exceeds
    /// [`MAX_ARRAY_LEN`] and `WireError::BadSignature` on over-deep nesting.
    pub fn value(&mut self, v: &Value) -> Result<(), WireError> {
        self.value_at_depth(v, 0)
    }

    fn value_at_depth(&mut self, v: &Value, depth: usize) -> Result<(), WireError> {
        if depth > MAX_NESTING_DEPTH * 2 {
            return Err(WireError::BadSignature(format!(
                "value nesting exceeds {}",
                MAX_NESTING_DEPTH * 2
            )));
        }

        match v {
            Value::Byte(b) => self.u8(*b),
            Value::Bool(b) => self.u32(u32::from(*b)),
            Value::Int16(n) => self.i16(*n),
            Value::Uint16(n) => self.u16(*n),
            Value::Int32(n) => self.i32(*n),
            Value::Uint32(n) | Value::Handle(n) => self.u32(*n),
            Value::Int64(n) => self.i64(*n),
            Value::Uint64(n) => self.u64(*n),
            Value::Double(d) => self.f64(*d),
            Value::String(s) | Value::ObjectPath(s) => self.string(s),
            Value::Signature(s) => self.signature(s),
            Value::Array { elem_sig, elems } => {
                let len_pos = self.reserve_u32();
                let elem_align = elem_sig
                    .bytes()
                    .next()
                    .map_or(Ok(1), |b| TypeId::try_from(b).map(TypeId::alignment))?;
                self.pad(elem_align);
                let data_start = self.buf.len();
                for elem in elems {
                    self.value_at_depth(elem, depth + 1)?;
                }
                let data_len = (self.buf.len() - data_start) as u32;
                if data_len > MAX_ARRAY_LEN {
                    return Err(WireError::BadLength {
                        what: "array",
                        len: data_len,
                        max: MAX_ARRAY_LEN,
                    });
                }
                self.patch_u32(len_pos, data_len);
            }
            Value::Struct(fields) => {
                self.pad(8);
                for field in fields {
                    self.value_at_depth(field, depth + 1)?;
                }
            }
            Value::Variant(inner) => {
                self.signature(&inner.signature());
                self.value_at_depth(inner, depth + 1)?;
            }
            Value::DictEntry(key, val) => {
                self.pad(8);
                self.value_at_depth(key, depth + 1)?;
                self.value_at_depth(val, depth + 1)?;
            }
        }
        Ok(())
    }
}
