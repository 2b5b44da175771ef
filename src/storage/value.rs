//! Property values and their stored type tags.

use std::fmt;

use crate::types::{Result, StoreError};

/// Stored type of a property or element payload.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TypeTag {
    /// Null value.
    Null = 0,
    /// Boolean value.
    Bool = 1,
    /// 64-bit signed integer.
    Int = 2,
    /// 64-bit unsigned integer.
    UInt = 3,
    /// 64-bit floating point number.
    Float = 4,
    /// UTF-8 string.
    Str = 5,
    /// Opaque bytes.
    Bytes = 6,
    /// Days since the Unix epoch.
    Date = 7,
    /// Milliseconds since the Unix epoch.
    DateTime = 8,
    /// Multi-valued property (small or big collection).
    List = 9,
}

impl TypeTag {
    /// Returns the on-page byte for this tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses an on-page tag byte.
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => TypeTag::Null,
            1 => TypeTag::Bool,
            2 => TypeTag::Int,
            3 => TypeTag::UInt,
            4 => TypeTag::Float,
            5 => TypeTag::Str,
            6 => TypeTag::Bytes,
            7 => TypeTag::Date,
            8 => TypeTag::DateTime,
            9 => TypeTag::List,
            _ => return Err(StoreError::Corrupted("unknown type tag")),
        })
    }

    /// Returns true for variable-length types that may be spilled.
    pub const fn is_blob(self) -> bool {
        matches!(self, TypeTag::Str | TypeTag::Bytes)
    }
}

/// Owned scalar value stored in a property slot or collection element.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit unsigned integer.
    UInt(u64),
    /// 64-bit floating point number.
    Float(f64),
    /// Owned string.
    Str(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
    /// Date value represented as days since epoch.
    Date(i64),
    /// DateTime value represented as milliseconds since epoch.
    DateTime(i64),
}

impl Value {
    /// Type tag of this value.
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::UInt(_) => TypeTag::UInt,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::Date(_) => TypeTag::Date,
            Value::DateTime(_) => TypeTag::DateTime,
        }
    }

    /// Raw bytes of a string or byte value.
    pub fn blob(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Rebuilds a string or byte value from bytes read back from overflow.
    pub fn from_blob(tag: TypeTag, bytes: Vec<u8>) -> Result<Self> {
        match tag {
            TypeTag::Str => String::from_utf8(bytes)
                .map(Value::Str)
                .map_err(|_| StoreError::Corrupted("overflowed string is not utf-8")),
            TypeTag::Bytes => Ok(Value::Bytes(bytes)),
            _ => Err(StoreError::Corrupted("overflow holds a non-blob type")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}u"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Bytes(v) => write!(f, "bytes(len={})", v.len()),
            Value::Date(v) => write!(f, "date({v})"),
            Value::DateTime(v) => write!(f, "datetime({v})"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
