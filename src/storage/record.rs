//! Byte image of a node record and its property slots.
//!
//! ```text
//! record:  kind u8 | flags u8 | slot_count u16 | reserved u32 | node u64 | slots...
//! slot:    prop u32 | tag word (2B) | flags u8 | payload
//! stub:    kind u8 | reserved u8 | slot u16 | page u32 | node u64
//! ```
//!
//! Collection payloads carry a u16 length prefix ahead of their encoding so a
//! slot can be skipped without decoding its elements.

use crate::primitives::bytes::be;
use crate::types::{NodeId, PageId, PropId, RecordAddr, Result, StoreError};

use super::codec::{self, Format, TagWord, TAG_WORD_LEN};
use super::collection::{BigDescriptor, SmallCollection};
use super::overflow::OverflowRef;
use super::value::{TypeTag, Value};

/// Bytes of the record header.
pub const RECORD_HDR_LEN: usize = 16;
/// Bytes of a forwarding stub.
pub const STUB_LEN: usize = 16;
/// Bytes of a slot header before its payload.
pub const SLOT_HDR_LEN: usize = 4 + TAG_WORD_LEN + 1;

const KIND_RECORD: u8 = 1;
const KIND_FORWARD: u8 = 2;

/// Record status flags.
pub mod record_flags {
    /// Excluded from visibility-filtered reads.
    pub const HIDDEN: u8 = 0x01;
    /// Logically deleted, awaiting purge.
    pub const SOFT_DELETED: u8 = 0x02;
    /// At least one slot holds a collection.
    pub const COMPOUND: u8 = 0x04;
    /// At least one slot, or an element of a small collection, references
    /// overflow. Elements of big collections live on their leaf pages and
    /// never set it; such records carry `COMPOUND` instead.
    pub const HAS_OVERFLOW: u8 = 0x08;
    /// Every defined flag.
    pub const ALL: u8 = HIDDEN | SOFT_DELETED | COMPOUND | HAS_OVERFLOW;
}

/// Property slot flags.
pub mod prop_flags {
    /// The property participates in a relation.
    pub const PART_OF_RELATION: u8 = 0x01;
    /// The property was forced out of line.
    pub const SEPARATE: u8 = 0x02;
    /// Changes are reported to the full-text indexer.
    pub const FULLTEXT: u8 = 0x04;
    /// Arithmetic treats the value as unsigned (logical shifts).
    pub const UNSIGNED: u8 = 0x08;
    /// Every defined flag.
    pub const ALL: u8 = PART_OF_RELATION | SEPARATE | FULLTEXT | UNSIGNED;
}

/// Payload of a property slot.
#[derive(Clone, Debug, PartialEq)]
pub enum SlotPayload {
    /// Scalar or blob stored in the record.
    Inline(Value),
    /// Blob stored in the overflow store.
    Overflow(OverflowRef),
    /// Inline collection.
    Small(SmallCollection),
    /// Paged collection.
    Big(BigDescriptor),
}

impl SlotPayload {
    fn tag_word(&self) -> TagWord {
        match self {
            SlotPayload::Inline(v) => codec::tag_word(v),
            SlotPayload::Overflow(r) => codec::overflow_tag_word(r),
            SlotPayload::Small(_) => TagWord::new(TypeTag::List, Format::SmallCollection, 0),
            SlotPayload::Big(_) => TagWord::new(TypeTag::List, Format::BigCollection, 0),
        }
    }

    /// Payload bytes following the slot header.
    pub fn encoded_size(&self) -> usize {
        match self {
            SlotPayload::Inline(v) => codec::encoded_size(v),
            SlotPayload::Overflow(r) => codec::overflow_ref_size(r.len),
            SlotPayload::Small(c) => 2 + c.encoded_size(),
            SlotPayload::Big(d) => 2 + d.encoded_size(),
        }
    }

    /// Returns true for either collection form.
    pub fn is_collection(&self) -> bool {
        matches!(self, SlotPayload::Small(_) | SlotPayload::Big(_))
    }

    /// Overflow references held directly by this payload or its inline
    /// elements. Always empty for big collections, whose elements are stored
    /// on leaf pages.
    pub fn overflow_refs(&self) -> Vec<OverflowRef> {
        match self {
            SlotPayload::Overflow(r) => vec![*r],
            SlotPayload::Small(c) => c
                .elements()
                .iter()
                .filter_map(|e| e.value.overflow().copied())
                .collect(),
            SlotPayload::Inline(_) | SlotPayload::Big(_) => Vec::new(),
        }
    }
}

/// One property of a record.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertySlot {
    /// Property id; unique within the record.
    pub prop: PropId,
    /// See [`prop_flags`].
    pub flags: u8,
    /// Stored payload.
    pub payload: SlotPayload,
}

impl PropertySlot {
    /// Creates a slot without flags.
    pub fn new(prop: PropId, payload: SlotPayload) -> Self {
        Self {
            prop,
            flags: 0,
            payload,
        }
    }

    /// Exact encoded length.
    pub fn encoded_size(&self) -> usize {
        SLOT_HDR_LEN + self.payload.encoded_size()
    }

    /// Encodes the slot at `off`, returning the bytes written.
    pub fn encode(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        be::put_u32(buf, off, self.prop.0)?;
        self.payload.tag_word().write(buf, off + 4)?;
        be::put_bytes(buf, off + 4 + TAG_WORD_LEN, &[self.flags])?;
        let cursor = off + SLOT_HDR_LEN;
        let written = match &self.payload {
            SlotPayload::Inline(v) => codec::encode(v, buf, cursor)?,
            SlotPayload::Overflow(r) => codec::encode_overflow_ref(r, buf, cursor)?,
            SlotPayload::Small(c) => {
                let n = c.encode(buf, cursor + 2)?;
                be::put_u16(buf, cursor, collection_len(n)?)?;
                2 + n
            }
            SlotPayload::Big(d) => {
                let n = d.encode(buf, cursor + 2)?;
                be::put_u16(buf, cursor, collection_len(n)?)?;
                2 + n
            }
        };
        Ok(SLOT_HDR_LEN + written)
    }

    /// Encodes the slot into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.encoded_size()];
        self.encode(&mut buf, 0)?;
        Ok(buf)
    }

    /// Decodes a slot at `*off`, advancing it. Overflow references are left
    /// unresolved.
    pub fn decode(buf: &[u8], off: &mut usize) -> Result<Self> {
        let prop = PropId(be::get_u32(buf, *off)?);
        let word = TagWord::read(buf, *off + 4)?;
        let flags = be::get_u8(buf, *off + 4 + TAG_WORD_LEN)?;
        if flags & !prop_flags::ALL != 0 {
            return Err(StoreError::Corrupted("unknown property flags"));
        }
        let mut cursor = *off + SLOT_HDR_LEN;
        let payload = match word.format {
            Format::SmallCollection | Format::BigCollection => {
                if word.tag != TypeTag::List {
                    return Err(StoreError::Corrupted("collection slot without list tag"));
                }
                let len = be::get_u16(buf, cursor)? as usize;
                cursor += 2;
                let end = cursor + len;
                let payload = if word.format == Format::SmallCollection {
                    SlotPayload::Small(SmallCollection::decode(buf, &mut cursor)?)
                } else {
                    SlotPayload::Big(BigDescriptor::decode(buf, &mut cursor)?)
                };
                if cursor != end {
                    return Err(StoreError::Corrupted("collection length prefix mismatch"));
                }
                payload
            }
            format if format.is_overflow() => {
                SlotPayload::Overflow(codec::decode_overflow_ref(word, buf, &mut cursor)?)
            }
            _ => SlotPayload::Inline(codec::decode_inline(word, buf, &mut cursor)?),
        };
        *off = cursor;
        Ok(Self {
            prop,
            flags,
            payload,
        })
    }
}

fn collection_len(n: usize) -> Result<u16> {
    u16::try_from(n).map_err(|_| StoreError::Invalid("inline collection exceeds 64 KiB"))
}

/// A node record: identity, status flags, and slots sorted by property id.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Persistent identity.
    pub node: NodeId,
    /// See [`record_flags`].
    pub flags: u8,
    slots: Vec<PropertySlot>,
}

impl NodeRecord {
    /// Creates an empty record.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            flags: 0,
            slots: Vec::new(),
        }
    }

    /// Slots sorted by property id.
    pub fn slots(&self) -> &[PropertySlot] {
        &self.slots
    }

    /// Returns the slot of `prop`.
    pub fn slot(&self, prop: PropId) -> Option<&PropertySlot> {
        self.position(prop).ok().map(|i| &self.slots[i])
    }

    /// Mutable slot of `prop`.
    pub fn slot_mut(&mut self, prop: PropId) -> Option<&mut PropertySlot> {
        match self.position(prop) {
            Ok(i) => Some(&mut self.slots[i]),
            Err(_) => None,
        }
    }

    fn position(&self, prop: PropId) -> std::result::Result<usize, usize> {
        self.slots.binary_search_by_key(&prop, |s| s.prop)
    }

    /// Inserts or replaces the slot for `slot.prop`, returning the old slot.
    pub fn put_slot(&mut self, slot: PropertySlot) -> Option<PropertySlot> {
        match self.position(slot.prop) {
            Ok(i) => Some(std::mem::replace(&mut self.slots[i], slot)),
            Err(i) => {
                self.slots.insert(i, slot);
                None
            }
        }
    }

    /// Removes the slot for `prop`.
    pub fn remove_slot(&mut self, prop: PropId) -> Option<PropertySlot> {
        self.position(prop).ok().map(|i| self.slots.remove(i))
    }

    /// Returns true if any of `flag` is set.
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Recomputes the derived flags from the slots.
    pub fn refresh_flags(&mut self) {
        let compound = self.slots.iter().any(|s| s.payload.is_collection());
        let overflow = self.slots.iter().any(|s| !s.payload.overflow_refs().is_empty());
        self.flags &= record_flags::HIDDEN | record_flags::SOFT_DELETED;
        if compound {
            self.flags |= record_flags::COMPOUND;
        }
        if overflow {
            self.flags |= record_flags::HAS_OVERFLOW;
        }
    }

    /// Exact encoded length.
    pub fn encoded_size(&self) -> usize {
        RECORD_HDR_LEN + self.slots.iter().map(PropertySlot::encoded_size).sum::<usize>()
    }

    /// Serializes the record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let count = u16::try_from(self.slots.len())
            .map_err(|_| StoreError::Invalid("too many property slots"))?;
        let mut buf = vec![0u8; self.encoded_size()];
        be::put_bytes(&mut buf, 0, &[KIND_RECORD, self.flags])?;
        be::put_u16(&mut buf, 2, count)?;
        be::put_u32(&mut buf, 4, 0)?;
        be::put_u64(&mut buf, 8, self.node.0)?;
        let mut cursor = RECORD_HDR_LEN;
        for slot in &self.slots {
            cursor += slot.encode(&mut buf, cursor)?;
        }
        Ok(buf)
    }

    fn decode_body(src: &[u8]) -> Result<Self> {
        let flags = be::get_u8(src, 1)?;
        if flags & !record_flags::ALL != 0 {
            return Err(StoreError::Corrupted("unknown record flags"));
        }
        let count = be::get_u16(src, 2)? as usize;
        let node = NodeId(be::get_u64(src, 8)?);
        let mut slots: Vec<PropertySlot> = Vec::with_capacity(count);
        let mut cursor = RECORD_HDR_LEN;
        for _ in 0..count {
            let slot = PropertySlot::decode(src, &mut cursor)?;
            if slots.last().is_some_and(|prev| prev.prop >= slot.prop) {
                return Err(StoreError::Corrupted("property slots out of order"));
            }
            slots.push(slot);
        }
        if cursor != src.len() {
            return Err(StoreError::Corrupted("trailing bytes after record"));
        }
        Ok(Self { node, flags, slots })
    }
}

/// Contents of a record slot on a page.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordImage {
    /// A record.
    Record(NodeRecord),
    /// A forwarding stub left by migration.
    Forward {
        /// Record the stub belongs to.
        node: NodeId,
        /// Address the record moved to.
        to: RecordAddr,
    },
}

impl RecordImage {
    /// Parses a record or stub.
    pub fn decode(src: &[u8]) -> Result<Self> {
        match be::get_u8(src, 0)? {
            KIND_RECORD => NodeRecord::decode_body(src).map(RecordImage::Record),
            KIND_FORWARD => {
                if src.len() != STUB_LEN {
                    return Err(StoreError::Corrupted("forwarding stub length"));
                }
                let slot = be::get_u16(src, 2)?;
                let page = PageId(be::get_u32(src, 4)?);
                if page.is_null() {
                    return Err(StoreError::Corrupted("forwarding stub to null page"));
                }
                Ok(RecordImage::Forward {
                    node: NodeId(be::get_u64(src, 8)?),
                    to: RecordAddr::new(page, slot),
                })
            }
            _ => Err(StoreError::Corrupted("unknown record kind")),
        }
    }
}

/// Encodes a forwarding stub for `node` pointing at `to`.
pub fn encode_stub(node: NodeId, to: RecordAddr) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; STUB_LEN];
    be::put_bytes(&mut buf, 0, &[KIND_FORWARD, 0])?;
    be::put_u16(&mut buf, 2, to.slot)?;
    be::put_u32(&mut buf, 4, to.page.0)?;
    be::put_u64(&mut buf, 8, node.0)?;
    Ok(buf)
}
