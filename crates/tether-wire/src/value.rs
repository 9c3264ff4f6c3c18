//! Owned typed values carried in message bodies and header fields.

use crate::error::WireError;
use crate::signature;
use crate::types::TypeId;

/// A single typed argument.
///
/// Arrays remember their element signature so empty arrays still marshal
/// with a concrete element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 8-bit unsigned integer
    Byte(u8),
    /// Boolean
    Bool(bool),
    /// 16-bit signed integer
    Int16(i16),
    /// 16-bit unsigned integer
    Uint16(u16),
    /// 32-bit signed integer
    Int32(i32),
    /// 32-bit unsigned integer
    Uint32(u32),
    /// 64-bit signed integer
    Int64(i64),
    /// 64-bit unsigned integer
    Uint64(u64),
    /// IEEE 754 double
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Bus object path
    ObjectPath(String),
    /// Type signature
    Signature(String),
    /// Index into the passed OS handles
    Handle(u32),
    /// Homogeneous array with its element signature
    Array {
        /// Signature of one element
        elem_sig: String,
        /// The elements, each matching `elem_sig`
        elems: Vec<Value>,
    },
    /// Heterogeneous field sequence
    Struct(Vec<Value>),
    /// A value boxed with its own signature
    Variant(Box<Value>),
    /// Dictionary key/value pair
    DictEntry(Box<Value>, Box<Value>),
}

impl Value {
    /// Build an array after checking every element against `elem_sig`.
    ///
    /// # Errors
    ///
    /// Returns `WireError::BadSignature` if `elem_sig` is not one complete
    /// type and `WireError::UnexpectedSignature` if any element disagrees.
    pub fn array(elem_sig: &str, elems: Vec<Value>) -> Result<Value, WireError> {
        let (first, rest) = signature::first_complete_type(elem_sig)?;
        if !rest.is_empty() {
            return Err(WireError::BadSignature(format!(
                "array element signature \"{elem_sig}\" is not one complete type"
            )));
        }
        for elem in &elems {
            let actual = elem.signature();
            if actual != first {
                return Err(WireError::UnexpectedSignature {
                    expected: first.to_string(),
                    actual,
                });
            }
        }
        Ok(Value::Array {
            elem_sig: first.to_string(),
            elems,
        })
    }

    /// Convenience constructor for a byte array (`ay`).
    #[must_use]
    pub fn byte_array(bytes: &[u8]) -> Value {
        Value::Array {
            elem_sig: "y".into(),
            elems: bytes.iter().map(|&b| Value::Byte(b)).collect(),
        }
    }

    /// The wire type of this value.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Byte(_) => TypeId::Byte,
            Value::Bool(_) => TypeId::Bool,
            Value::Int16(_) => TypeId::Int16,
            Value::Uint16(_) => TypeId::Uint16,
            Value::Int32(_) => TypeId::Int32,
            Value::Uint32(_) => TypeId::Uint32,
            Value::Int64(_) => TypeId::Int64,
            Value::Uint64(_) => TypeId::Uint64,
            Value::Double(_) => TypeId::Double,
            Value::String(_) => TypeId::String,
            Value::ObjectPath(_) => TypeId::ObjectPath,
            Value::Signature(_) => TypeId::Signature,
            Value::Handle(_) => TypeId::Handle,
            Value::Array { .. } => TypeId::Array,
            Value::Struct(_) => TypeId::Struct,
            Value::Variant(_) => TypeId::Variant,
            Value::DictEntry(..) => TypeId::DictEntry,
        }
    }

    /// The complete signature of this value.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut sig = String::new();
        self.write_signature(&mut sig);
        sig
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Array { elem_sig, .. } => {
                out.push('a');
                out.push_str(elem_sig);
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Value::Variant(_) => out.push('v'),
            Value::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            other => out.push(other.type_id().as_char()),
        }
    }

    /// Borrow as `&str` for the three string-like types.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    /// Extract a `u32`, if that is what this is.
    #[must_use]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) | Value::Handle(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract a `u16`, if that is what this is.
    #[must_use]
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::Uint16(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the raw bytes of a byte array (`ay`), if that is what this is.
    #[must_use]
    pub fn as_byte_array(&self) -> Option<Vec<u8>> {
        match self {
            Value::Array { elem_sig, elems } if elem_sig == "y" => Some(
                elems
                    .iter()
                    .filter_map(|e| match e {
                        Value::Byte(b) => Some(*b),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Signature of a value sequence, e.g. a message body.
#[must_use]
pub fn signature_of(values: &[Value]) -> String {
    let mut sig = String::new();
    for value in values {
        value.write_signature(&mut sig);
    }
    sig
}

/// Whether `path` is a syntactically legal bus object path.
///
/// Legal paths are `/` or `/`-separated non-empty segments of
/// `[A-Za-z0-9_]`, with no trailing slash.
#[must_use]
pub fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    rest.split('/')
        .all(|seg| !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}
