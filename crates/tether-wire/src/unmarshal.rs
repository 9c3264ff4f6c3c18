//! Bounds-checked, endian-aware unmarshaling.
//!
//! The reader walks the message's single owned buffer with an absolute
//! position so alignment stays message-relative. When the envelope's endian
//! tag disagrees with the local byte order, every multi-byte scalar is
//! swapped as it is read.

use crate::error::WireError;
use crate::signature;
use crate::types::TypeId;
use crate::value::{is_valid_object_path, Value};
use crate::{MAX_ARRAY_LEN, MAX_NESTING_DEPTH};

/// Unmarshaling reader over a message buffer.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
    swap: bool,
}

impl<'a> Reader<'a> {
    /// Create a reader over `buf` starting at byte 0.
    #[must_use]
    pub fn new(buf: &'a [u8], swap: bool) -> Self {
        Self {
            buf,
            pos: 0,
            limit: buf.len(),
            swap,
        }
    }

    /// Create a reader positioned at `pos` and refusing to read past `limit`.
    #[must_use]
    pub fn new_at(buf: &'a [u8], pos: usize, limit: usize, swap: bool) -> Self {
        let limit = limit.min(buf.len());
        Self {
            buf,
            pos: pos.min(limit),
            limit,
            swap,
        }
    }

    /// Current absolute position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Bytes left before the limit.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.limit {
            return Err(WireError::TooShort {
                expected: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Skip forward to the next multiple of `alignment`.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` if padding would cross the limit.
    pub fn align(&mut self, alignment: usize) -> Result<(), WireError> {
        let rem = self.pos % alignment;
        if rem != 0 {
            self.take(alignment - rem)?;
        }
        Ok(())
    }

    /// Read one byte.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` at the limit.
    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read an aligned u16.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` past the limit.
    pub fn u16(&mut self) -> Result<u16, WireError> {
        self.align(2)?;
        // take() guarantees the slice length.
        let v = u16::from_ne_bytes(self.take(2)?.try_into().unwrap());
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    /// Read an aligned i16.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` past the limit.
    pub fn i16(&mut self) -> Result<i16, WireError> {
        Ok(self.u16()? as i16)
    }

    /// Read an aligned u32.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` past the limit.
    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.align(4)?;
        let v = u32::from_ne_bytes(self.take(4)?.try_into().unwrap());
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    /// Read an aligned i32.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` past the limit.
    pub fn i32(&mut self) -> Result<i32, WireError> {
        Ok(self.u32()? as i32)
    }

    /// Read an aligned u64.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` past the limit.
    pub fn u64(&mut self) -> Result<u64, WireError> {
        self.align(8)?;
        let v = u64::from_ne_bytes(self.take(8)?.try_into().unwrap());
        Ok(if self.swap { v.swap_bytes() } else { v })
    }

    /// Read an aligned i64.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` past the limit.
    pub fn i64(&mut self) -> Result<i64, WireError> {
        Ok(self.u64()? as i64)
    }

    /// Read an aligned f64.
    ///
    /// # Errors
    ///
    /// Returns `WireError::TooShort` past the limit.
    pub fn f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Read a u32-length-prefixed, NUL-terminated string.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BadLength` on an oversized declared length,
    /// `WireError::NotNulTerminated` on missing or embedded NUL, and
    /// `WireError::BadValue` on invalid UTF-8.
    pub fn string(&mut self) -> Result<&'a str, WireError> {
        let len = self.u32()?;
        if len > MAX_ARRAY_LEN {
            return Err(WireError::BadLength {
                what: "string",
                len,
                max: MAX_ARRAY_LEN,
            });
        }
        let raw = self.take(len as usize + 1)?;
        str_from_nul_terminated(raw)
    }

    /// Read a u8-length-prefixed, NUL-terminated signature string.
    ///
    /// The content is not validated here; callers validate against their
    /// own depth and shape expectations.
    ///
    /// # Errors
    ///
    /// Returns `WireError::NotNulTerminated` or `WireError::BadValue` as
    /// [`Reader::string`] does.
    pub fn signature(&mut self) -> Result<&'a str, WireError> {
        let len = self.u8()?;
        let raw = self.take(len as usize + 1)?;
        str_from_nul_terminated(raw)
    }

    /// Unmarshal one complete value described by `sig`.
    ///
    /// `sig` must be exactly one complete type.
    ///
    /// # Errors
    ///
    /// Any `WireError` decode failure; never reads past the limit.
    pub fn value(&mut self, sig: &str) -> Result<Value, WireError> {
        self.value_at_depth(sig, 0)
    }

    fn value_at_depth(&mut self, sig: &str, depth: usize) -> Result<Value, WireError> {
        if depth > MAX_NESTING_DEPTH * 2 {
            return Err(WireError::BadSignature(format!(
                "value nesting exceeds {}",
                MAX_NESTING_DEPTH * 2
            )));
        }

        let Some(&type_byte) = sig.as_bytes().first() else {
            return Err(WireError::BadSignature("empty signature".into()));
        };

        match TypeId::try_from(type_byte)? {
            TypeId::Byte => Ok(Value::Byte(self.u8()?)),
            TypeId::Bool => match self.u32()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(WireError::BadValue(format!("boolean byte value {other}"))),
            },
            TypeId::Int16 => Ok(Value::Int16(self.i16()?)),
            TypeId::Uint16 => Ok(Value::Uint16(self.u16()?)),
            TypeId::Int32 => Ok(Value::Int32(self.i32()?)),
            TypeId::Uint32 => Ok(Value::Uint32(self.u32()?)),
            TypeId::Int64 => Ok(Value::Int64(self.i64()?)),
            TypeId::Uint64 => Ok(Value::Uint64(self.u64()?)),
            TypeId::Double => Ok(Value::Double(self.f64()?)),
            TypeId::Handle => Ok(Value::Handle(self.u32()?)),
            TypeId::String => Ok(Value::String(self.string()?.to_string())),
            TypeId::ObjectPath => {
                let path = self.string()?;
                if !is_valid_object_path(path) {
                    return Err(WireError::BadValue(format!("object path \"{path}\"")));
                }
                Ok(Value::ObjectPath(path.to_string()))
            }
            TypeId::Signature => {
                let s = self.signature()?;
                signature::validate(s)?;
                Ok(Value::Signature(s.to_string()))
            }
            TypeId::Array => {
                let elem_sig = &sig[1..];
                let byte_len = self.u32()?;
                if byte_len > MAX_ARRAY_LEN {
                    return Err(WireError::BadLength {
                        what: "array",
                        len: byte_len,
                        max: MAX_ARRAY_LEN,
                    });
                }
                let elem_align = elem_sig
                    .bytes()
                    .next()
                    .map_or(Ok(1), |b| TypeId::try_from(b).map(TypeId::alignment))?;
                self.align(elem_align)?;

                let end = self.pos + byte_len as usize;
                if end > self.limit {
                    return Err(WireError::TooShort {
                        expected: byte_len as usize,
                        actual: self.remaining(),
                    });
                }

                let mut elems = Vec::new();
                while self.pos < end {
                    elems.push(self.value_at_depth(elem_sig, depth + 1)?);
                }
                if self.pos != end {
                    return Err(WireError::BadValue(
                        "array elements overrun declared length".into(),
                    ));
                }
                Ok(Value::Array {
                    elem_sig: elem_sig.to_string(),
                    elems,
                })
            }
            TypeId::Struct => {
                let inner = sig
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| WireError::BadSignature(format!("malformed struct \"{sig}\"")))?;
                self.align(8)?;
                let mut fields = Vec::new();
                let mut rest = inner;
                while !rest.is_empty() {
                    let (first, tail) = signature::first_complete_type(rest)?;
                    fields.push(self.value_at_depth(first, depth + 1)?);
                    rest = tail;
                }
                Ok(Value::Struct(fields))
            }
            TypeId::Variant => {
                let inner_sig = self.signature()?.to_string();
                if signature::count_complete_types(&inner_sig)? != 1 {
                    return Err(WireError::BadSignature(format!(
                        "variant signature \"{inner_sig}\" is not one complete type"
                    )));
                }
                let inner = self.value_at_depth(&inner_sig, depth + 1)?;
                Ok(Value::Variant(Box::new(inner)))
            }
            TypeId::DictEntry => {
                let inner = sig
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
                    .ok_or_else(|| {
                        WireError::BadSignature(format!("malformed dict entry \"{sig}\""))
                    })?;
                let (key_sig, val_sig) = signature::first_complete_type(inner)?;
                self.align(8)?;
                let key = self.value_at_depth(key_sig, depth + 1)?;
                let val = self.value_at_depth(val_sig, depth + 1)?;
                Ok(Value::DictEntry(Box::new(key), Box::new(val)))
            }
        }
    }
}

fn str_from_nul_terminated(raw: &[u8]) -> Result<&str, WireError> {
    let Some((&last, content)) = raw.split_last() else {
        return Err(WireError::NotNulTerminated);
    };
    if last != 0 || content.contains(&0) {
        return Err(WireError::NotNulTerminated);
    }
    std::str::from_utf8(content).map_err(|e| WireError::BadValue(format!("invalid UTF-8: {e}")))
}
