//! Payload encoding for property slots and collection elements.
//!
//! Every payload is described by a two-byte tag word: the type/format byte
//! and an immediate byte. Small unsigned scalars use [`Format::Compact`] and
//! live entirely in the immediate byte, so they occupy zero payload bytes.

use crate::primitives::bytes::{be, var};
use crate::types::{PageId, Result, StoreError};

use super::overflow::{OverflowRef, OverflowStore};
use super::value::{TypeTag, Value};

/// Bytes of the tag word (type/format byte plus immediate byte).
pub const TAG_WORD_LEN: usize = 2;
/// Payload bytes of an overflow reference for values up to 64 KiB.
pub const OVERFLOW_SHORT_LEN: usize = 4 + 2 + 4;
/// Payload bytes of an overflow reference with an 8-byte total length.
pub const OVERFLOW_LONG_LEN: usize = 4 + 8 + 4;
/// Largest blob that can be stored inline (two-byte length prefix).
pub const MAX_INLINE_BLOB: usize = u16::MAX as usize;

/// Physical layout of the payload following a tag word.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Format {
    /// Fixed-width or self-delimiting scalar payload.
    Fixed = 0,
    /// Value stored in the immediate byte; no payload.
    Compact = 1,
    /// One-byte length prefix plus bytes.
    Len8 = 2,
    /// Two-byte length prefix plus bytes.
    Len16 = 3,
    /// Overflow reference with a two-byte length.
    OverflowShort = 4,
    /// Overflow reference with an eight-byte length.
    OverflowLong = 5,
    /// Length-prefixed inline collection.
    SmallCollection = 6,
    /// Length-prefixed big collection descriptor.
    BigCollection = 7,
}

impl Format {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Format::Fixed,
            1 => Format::Compact,
            2 => Format::Len8,
            3 => Format::Len16,
            4 => Format::OverflowShort,
            5 => Format::OverflowLong,
            6 => Format::SmallCollection,
            _ => Format::BigCollection,
        }
    }

    /// Returns true for the two overflow reference formats.
    pub const fn is_overflow(self) -> bool {
        matches!(self, Format::OverflowShort | Format::OverflowLong)
    }
}

/// Decoded tag word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TagWord {
    /// Stored type.
    pub tag: TypeTag,
    /// Payload layout.
    pub format: Format,
    /// Immediate byte (compact value or zero).
    pub immediate: u8,
}

impl TagWord {
    /// Builds a tag word.
    pub const fn new(tag: TypeTag, format: Format, immediate: u8) -> Self {
        Self {
            tag,
            format,
            immediate,
        }
    }

    /// Packs the type/format byte.
    pub fn type_byte(self) -> u8 {
        (self.tag.as_u8() << 3) | self.format as u8
    }

    /// Writes the tag word at `off`.
    pub fn write(self, dst: &mut [u8], off: usize) -> Result<()> {
        be::put_bytes(dst, off, &[self.type_byte(), self.immediate])
    }

    /// Reads the tag word at `off`.
    pub fn read(src: &[u8], off: usize) -> Result<Self> {
        let raw = be::get_u8(src, off)?;
        let immediate = be::get_u8(src, off + 1)?;
        let tag = TypeTag::from_u8(raw >> 3)?;
        Ok(Self::new(tag, Format::from_bits(raw), immediate))
    }
}

/// How much of an out-of-line payload a decode resolves.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadMode {
    /// Materialize overflowed values; a missing chunk is `NotFound`.
    Full,
    /// Leave overflowed values as references.
    Lazy,
}

/// Result of decoding a payload under a [`LoadMode`].
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    /// The value itself.
    Value(Value),
    /// An overflow reference left unresolved by [`LoadMode::Lazy`].
    Deferred(OverflowRef),
}

fn compact_immediate(value: &Value) -> Option<u8> {
    match *value {
        Value::Null => Some(0),
        Value::Bool(b) => Some(b as u8),
        Value::Int(v) if (0..=u8::MAX as i64).contains(&v) => Some(v as u8),
        Value::UInt(v) if v <= u8::MAX as u64 => Some(v as u8),
        _ => None,
    }
}

/// Tag word an inline encoding of `value` uses.
pub fn tag_word(value: &Value) -> TagWord {
    let tag = value.tag();
    if let Some(imm) = compact_immediate(value) {
        return TagWord::new(tag, Format::Compact, imm);
    }
    match value.blob() {
        Some(bytes) if bytes.len() <= u8::MAX as usize => TagWord::new(tag, Format::Len8, 0),
        Some(_) => TagWord::new(tag, Format::Len16, 0),
        None => TagWord::new(tag, Format::Fixed, 0),
    }
}

/// Exact number of payload bytes `value` occupies inline, excluding the tag
/// word. Compact scalars report zero.
pub fn encoded_size(value: &Value) -> usize {
    if compact_immediate(value).is_some() {
        return 0;
    }
    match value {
        Value::Int(v) | Value::Date(v) | Value::DateTime(v) => var::len_i64(*v),
        Value::UInt(v) => var::len_u64(*v),
        Value::Float(_) => 8,
        Value::Str(_) | Value::Bytes(_) => {
            let len = value.blob().map_or(0, <[u8]>::len);
            if len <= u8::MAX as usize {
                1 + len
            } else {
                2 + len
            }
        }
        Value::Null | Value::Bool(_) => 0,
    }
}

/// Returns true if `value` has an inline encoding at all.
pub fn fits_inline(value: &Value) -> bool {
    value.blob().map_or(true, |b| b.len() <= MAX_INLINE_BLOB)
}

/// Payload bytes of the overflow reference `r` would be encoded with.
pub fn overflow_ref_size(len: u64) -> usize {
    if len <= u16::MAX as u64 {
        OVERFLOW_SHORT_LEN
    } else {
        OVERFLOW_LONG_LEN
    }
}

/// Encodes the payload of `value` at `cursor`, returning the bytes written.
/// The matching tag word comes from [`tag_word`].
pub fn encode(value: &Value, buf: &mut [u8], cursor: usize) -> Result<usize> {
    if compact_immediate(value).is_some() {
        return Ok(0);
    }
    match value {
        Value::Int(v) | Value::Date(v) | Value::DateTime(v) => var::put_i64(buf, cursor, *v),
        Value::UInt(v) => var::put_u64(buf, cursor, *v),
        Value::Float(v) => {
            be::put_u64(buf, cursor, v.to_bits())?;
            Ok(8)
        }
        Value::Str(_) | Value::Bytes(_) => {
            let bytes = value.blob().unwrap_or_default();
            if bytes.len() <= u8::MAX as usize {
                be::put_bytes(buf, cursor, &[bytes.len() as u8])?;
                be::put_bytes(buf, cursor + 1, bytes)?;
                Ok(1 + bytes.len())
            } else if bytes.len() <= MAX_INLINE_BLOB {
                be::put_u16(buf, cursor, bytes.len() as u16)?;
                be::put_bytes(buf, cursor + 2, bytes)?;
                Ok(2 + bytes.len())
            } else {
                Err(StoreError::Invalid("value too large to inline"))
            }
        }
        Value::Null | Value::Bool(_) => Ok(0),
    }
}

/// Decodes an inline payload described by `word`, advancing `cursor`.
pub fn decode_inline(word: TagWord, buf: &[u8], cursor: &mut usize) -> Result<Value> {
    match (word.format, word.tag) {
        (Format::Compact, TypeTag::Null) => Ok(Value::Null),
        (Format::Compact, TypeTag::Bool) => match word.immediate {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            _ => Err(StoreError::Corrupted("invalid compact bool")),
        },
        (Format::Compact, TypeTag::Int) => Ok(Value::Int(word.immediate as i64)),
        (Format::Compact, TypeTag::UInt) => Ok(Value::UInt(word.immediate as u64)),
        (Format::Fixed, TypeTag::Int) => Ok(Value::Int(var::get_i64(buf, cursor)?)),
        (Format::Fixed, TypeTag::Date) => Ok(Value::Date(var::get_i64(buf, cursor)?)),
        (Format::Fixed, TypeTag::DateTime) => Ok(Value::DateTime(var::get_i64(buf, cursor)?)),
        (Format::Fixed, TypeTag::UInt) => Ok(Value::UInt(var::get_u64(buf, cursor)?)),
        (Format::Fixed, TypeTag::Float) => {
            let bits = be::get_u64(buf, *cursor)?;
            *cursor += 8;
            Ok(Value::Float(f64::from_bits(bits)))
        }
        (Format::Len8, tag) | (Format::Len16, tag) if tag.is_blob() => {
            let len = if word.format == Format::Len8 {
                let len = be::get_u8(buf, *cursor)? as usize;
                *cursor += 1;
                len
            } else {
                let len = be::get_u16(buf, *cursor)? as usize;
                *cursor += 2;
                len
            };
            let bytes = be::get_bytes(buf, *cursor, len)?.to_vec();
            *cursor += len;
            Value::from_blob(tag, bytes)
        }
        _ => Err(StoreError::Corrupted("unrecognized inline tag")),
    }
}

/// Tag word for an overflow reference.
pub fn overflow_tag_word(r: &OverflowRef) -> TagWord {
    let format = if r.len <= u16::MAX as u64 {
        Format::OverflowShort
    } else {
        Format::OverflowLong
    };
    TagWord::new(r.tag, format, 0)
}

/// Encodes an overflow reference at `cursor`, returning the bytes written.
pub fn encode_overflow_ref(r: &OverflowRef, buf: &mut [u8], cursor: usize) -> Result<usize> {
    be::put_u32(buf, cursor, r.start.0)?;
    if r.len <= u16::MAX as u64 {
        be::put_u16(buf, cursor + 4, r.len as u16)?;
        be::put_u32(buf, cursor + 6, r.checksum)?;
        Ok(OVERFLOW_SHORT_LEN)
    } else {
        be::put_u64(buf, cursor + 4, r.len)?;
        be::put_u32(buf, cursor + 12, r.checksum)?;
        Ok(OVERFLOW_LONG_LEN)
    }
}

/// Decodes an overflow reference described by `word`, advancing `cursor`.
pub fn decode_overflow_ref(word: TagWord, buf: &[u8], cursor: &mut usize) -> Result<OverflowRef> {
    if !word.tag.is_blob() {
        return Err(StoreError::Corrupted("overflow reference on non-blob type"));
    }
    let start = PageId(be::get_u32(buf, *cursor)?);
    let (len, checksum) = match word.format {
        Format::OverflowShort => {
            let len = be::get_u16(buf, *cursor + 4)? as u64;
            let crc = be::get_u32(buf, *cursor + 6)?;
            *cursor += OVERFLOW_SHORT_LEN;
            (len, crc)
        }
        Format::OverflowLong => {
            let len = be::get_u64(buf, *cursor + 4)?;
            let crc = be::get_u32(buf, *cursor + 12)?;
            *cursor += OVERFLOW_LONG_LEN;
            (len, crc)
        }
        _ => return Err(StoreError::Corrupted("not an overflow reference")),
    };
    if start.is_null() {
        return Err(StoreError::Corrupted("overflow reference to null page"));
    }
    Ok(OverflowRef {
        start,
        tag: word.tag,
        len,
        checksum,
    })
}

/// Decodes either an inline value or an overflow reference. With
/// [`LoadMode::Full`] the referenced chunks are read back.
pub fn decode(
    word: TagWord,
    buf: &[u8],
    cursor: &mut usize,
    mode: LoadMode,
    overflow: &OverflowStore,
) -> Result<Decoded> {
    if !word.format.is_overflow() {
        return decode_inline(word, buf, cursor).map(Decoded::Value);
    }
    let r = decode_overflow_ref(word, buf, cursor)?;
    resolve(&r, mode, overflow)
}

/// Resolves an already decoded overflow reference under `mode`.
pub fn resolve(r: &OverflowRef, mode: LoadMode, overflow: &OverflowStore) -> Result<Decoded> {
    match mode {
        LoadMode::Lazy => Ok(Decoded::Deferred(*r)),
        LoadMode::Full => {
            let bytes = overflow.read_value(r)?;
            Value::from_blob(r.tag, bytes).map(Decoded::Value)
        }
    }
}
