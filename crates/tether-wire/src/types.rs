//! Type identifiers for marshaled values.

use crate::error::WireError;

/// Wire type ids, one ASCII byte each as they appear inside signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// 8-bit unsigned integer
    Byte = b'y',
    /// Boolean, marshaled as a 32-bit 0/1
    Bool = b'b',
    /// 16-bit signed integer
    Int16 = b'n',
    /// 16-bit unsigned integer
    Uint16 = b'q',
    /// 32-bit signed integer
    Int32 = b'i',
    /// 32-bit unsigned integer
    Uint32 = b'u',
    /// 64-bit signed integer
    Int64 = b'x',
    /// 64-bit unsigned integer
    Uint64 = b't',
    /// IEEE 754 double
    Double = b'd',
    /// UTF-8 string, u32 length prefix, NUL terminated
    String = b's',
    /// Bus object path, string rules plus path syntax
    ObjectPath = b'o',
    /// Type signature, u8 length prefix, NUL terminated
    Signature = b'g',
    /// Index into the out-of-band passed OS handles
    Handle = b'h',
    /// Homogeneous array, u32 byte-count prefix
    Array = b'a',
    /// Struct of heterogeneous fields, 8-aligned
    Struct = b'(',
    /// Tagged value carrying its own signature
    Variant = b'v',
    /// Key/value pair inside a dictionary array, 8-aligned
    DictEntry = b'{',
}

impl TypeId {
    /// Natural wire alignment of this type in bytes.
    #[must_use]
    pub fn alignment(self) -> usize {
        match self {
            TypeId::Byte | TypeId::Signature | TypeId::Variant => 1,
            TypeId::Int16 | TypeId::Uint16 => 2,
            TypeId::Bool
            | TypeId::Int32
            | TypeId::Uint32
            | TypeId::String
            | TypeId::ObjectPath
            | TypeId::Handle
            | TypeId::Array => 4,
            TypeId::Int64
            | TypeId::Uint64
            | TypeId::Double
            | TypeId::Struct
            | TypeId::DictEntry => 8,
        }
    }

    /// Whether this is a fixed-meaning scalar or string type (not a container).
    #[must_use]
    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            TypeId::Array | TypeId::Struct | TypeId::Variant | TypeId::DictEntry
        )
    }

    /// The signature character for this type.
    #[must_use]
    pub fn as_char(self) -> char {
        self as u8 as char
    }
}

impl TryFrom<u8> for TypeId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'y' => Ok(Self::Byte),
            b'b' => Ok(Self::Bool),
            b'n' => Ok(Self::Int16),
            b'q' => Ok(Self::Uint16),
            b'i' => Ok(Self::Int32),
            b'u' => Ok(Self::Uint32),
            b'x' => Ok(Self::Int64),
            b't' => Ok(Self::Uint64),
            b'd' => Ok(Self::Double),
            b's' => Ok(Self::String),
            b'o' => Ok(Self::ObjectPath),
            b'g' => Ok(Self::Signature),
            b'h' => Ok(Self::Handle),
            b'a' => Ok(Self::Array),
            b'(' => Ok(Self::Struct),
            b'v' => Ok(Self::Variant),
            b'{' => Ok(Self::DictEntry),
            other => Err(WireError::InvalidTypeId(other)),
        }
    }
}
