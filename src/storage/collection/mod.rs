#![forbid(unsafe_code)]
//! Ordered multi-valued properties addressed by stable element ids.
//!
//! Elements are keyed by [`ElementId`]; logical order is key order except
//! where an element carries an explicit link. A neighbour is resolved by
//! following the explicit link when present and the key-adjacent element
//! otherwise. Every operation here is written against [`ElementRead`] and
//! [`ElementWrite`], so the inline ([`SmallCollection`]) and paged
//! ([`big::BigHandle`]) forms share one implementation of the link logic.
//!
//! Links are normalized on every write: a link equal to the key neighbour
//! is stored implicitly, so pure appends never carry link words.

pub mod big;
mod cursor;
mod small;

use crate::primitives::bytes::be;
use crate::types::{ElementId, Result, StoreError};

use super::codec::{self, TagWord};
use super::overflow::OverflowRef;
use super::value::Value;

pub use big::{BigDescriptor, BigHandle, BigView, FanoutEntry};
pub use cursor::{Cursor, Direction};
pub use small::SmallCollection;

const HAS_PREV: u8 = 0x01;
const HAS_NEXT: u8 = 0x02;

/// Explicit-link state of one element.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Link {
    /// Both neighbours are the key-adjacent elements.
    KeyOnly,
    /// Explicit previous element; `NIL` means "no previous".
    Prev(ElementId),
    /// Explicit next element; `NIL` means "no next".
    Next(ElementId),
    /// Both neighbours explicit.
    Both {
        /// Explicit previous element.
        prev: ElementId,
        /// Explicit next element.
        next: ElementId,
    },
}

impl Link {
    /// Builds a link from optional explicit neighbours.
    pub fn from_parts(prev: Option<ElementId>, next: Option<ElementId>) -> Self {
        match (prev, next) {
            (None, None) => Link::KeyOnly,
            (Some(prev), None) => Link::Prev(prev),
            (None, Some(next)) => Link::Next(next),
            (Some(prev), Some(next)) => Link::Both { prev, next },
        }
    }

    /// Explicit previous element, if any.
    pub fn prev(self) -> Option<ElementId> {
        match self {
            Link::Prev(prev) | Link::Both { prev, .. } => Some(prev),
            Link::KeyOnly | Link::Next(_) => None,
        }
    }

    /// Explicit next element, if any.
    pub fn next(self) -> Option<ElementId> {
        match self {
            Link::Next(next) | Link::Both { next, .. } => Some(next),
            Link::KeyOnly | Link::Prev(_) => None,
        }
    }

    /// Replaces the previous half of the link.
    pub fn with_prev(self, prev: Option<ElementId>) -> Self {
        Self::from_parts(prev, self.next())
    }

    /// Replaces the next half of the link.
    pub fn with_next(self, next: Option<ElementId>) -> Self {
        Self::from_parts(self.prev(), next)
    }

    fn words(self) -> usize {
        self.prev().is_some() as usize + self.next().is_some() as usize
    }
}

/// Payload of an element: inline or overflowed.
#[derive(Clone, Debug, PartialEq)]
pub enum ElementValue {
    /// Stored inside the element.
    Inline(Value),
    /// Stored in the overflow store.
    Overflow(OverflowRef),
}

impl ElementValue {
    /// Overflow reference held by this payload.
    pub fn overflow(&self) -> Option<&OverflowRef> {
        match self {
            ElementValue::Overflow(r) => Some(r),
            ElementValue::Inline(_) => None,
        }
    }

    fn tag_word(&self) -> TagWord {
        match self {
            ElementValue::Inline(v) => codec::tag_word(v),
            ElementValue::Overflow(r) => codec::overflow_tag_word(r),
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            ElementValue::Inline(v) => codec::encoded_size(v),
            ElementValue::Overflow(r) => codec::overflow_ref_size(r.len),
        }
    }
}

/// One element of a collection.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    /// Stable element id.
    pub id: ElementId,
    /// Explicit links.
    pub link: Link,
    /// Payload.
    pub value: ElementValue,
}

impl Element {
    /// Creates an element with key-order links.
    pub fn new(id: ElementId, value: ElementValue) -> Self {
        Self {
            id,
            link: Link::KeyOnly,
            value,
        }
    }

    /// Exact encoded length.
    pub fn encoded_size(&self) -> usize {
        4 + 2 + 4 * self.link.words() + codec::TAG_WORD_LEN + self.value.payload_size()
    }

    /// Encodes the element at `off`, returning the bytes written.
    pub fn encode(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        be::put_u32(buf, off, self.id.0)?;
        let mut flags = 0u8;
        let mut cursor = off + 6;
        if let Some(prev) = self.link.prev() {
            flags |= HAS_PREV;
            be::put_u32(buf, cursor, prev.0)?;
            cursor += 4;
        }
        if let Some(next) = self.link.next() {
            flags |= HAS_NEXT;
            be::put_u32(buf, cursor, next.0)?;
            cursor += 4;
        }
        be::put_bytes(buf, off + 4, &[self.link.words() as u8, flags])?;
        self.value.tag_word().write(buf, cursor)?;
        cursor += codec::TAG_WORD_LEN;
        cursor += match &self.value {
            ElementValue::Inline(v) => codec::encode(v, buf, cursor)?,
            ElementValue::Overflow(r) => codec::encode_overflow_ref(r, buf, cursor)?,
        };
        Ok(cursor - off)
    }

    /// Decodes an element at `*off`, advancing it.
    pub fn decode(buf: &[u8], off: &mut usize) -> Result<Self> {
        let id = ElementId(be::get_u32(buf, *off)?);
        if id.is_nil() {
            return Err(StoreError::Corrupted("collection element with nil id"));
        }
        let words = be::get_u8(buf, *off + 4)?;
        let flags = be::get_u8(buf, *off + 5)?;
        if flags & !(HAS_PREV | HAS_NEXT) != 0 || words != flags.count_ones() as u8 {
            return Err(StoreError::Corrupted("collection element link flags invalid"));
        }
        let mut cursor = *off + 6;
        let prev = if flags & HAS_PREV != 0 {
            let prev = ElementId(be::get_u32(buf, cursor)?);
            cursor += 4;
            Some(prev)
        } else {
            None
        };
        let next = if flags & HAS_NEXT != 0 {
            let next = ElementId(be::get_u32(buf, cursor)?);
            cursor += 4;
            Some(next)
        } else {
            None
        };
        let word = TagWord::read(buf, cursor)?;
        cursor += codec::TAG_WORD_LEN;
        let value = if word.format.is_overflow() {
            ElementValue::Overflow(codec::decode_overflow_ref(word, buf, &mut cursor)?)
        } else {
            ElementValue::Inline(codec::decode_inline(word, buf, &mut cursor)?)
        };
        *off = cursor;
        Ok(Self {
            id,
            link: Link::from_parts(prev, next),
            value,
        })
    }
}

/// Count, id generator, and logical endpoints of a collection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ListHeader {
    /// Live elements.
    pub count: u32,
    /// Next id handed out by the generator.
    pub next_id: u32,
    /// Logical first element.
    pub first: ElementId,
    /// Logical last element.
    pub last: ElementId,
}

impl Default for ListHeader {
    fn default() -> Self {
        Self {
            count: 0,
            next_id: 1,
            first: ElementId::NIL,
            last: ElementId::NIL,
        }
    }
}

/// Keyed read access to a collection.
pub trait ElementRead {
    /// Current header.
    fn header(&self) -> ListHeader;
    /// Element with key `id`.
    fn get(&self, id: ElementId) -> Result<Option<Element>>;
    /// Smallest key greater than `id`.
    fn key_succ(&self, id: ElementId) -> Result<Option<ElementId>>;
    /// Largest key smaller than `id`.
    fn key_pred(&self, id: ElementId) -> Result<Option<ElementId>>;
}

/// Keyed write access to a collection. Callers keep links consistent.
pub trait ElementWrite: ElementRead {
    /// Replaces an existing element.
    fn put(&mut self, element: Element) -> Result<()>;
    /// Adds an element under a key not yet present.
    fn insert_new(&mut self, element: Element) -> Result<()>;
    /// Removes and returns an element.
    fn remove(&mut self, id: ElementId) -> Result<Element>;
    /// Replaces the header.
    fn set_header(&mut self, header: ListHeader) -> Result<()>;
}

/// Where [`insert`] places the new element.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Position {
    /// After the logical last element.
    End,
    /// Immediately before the given element.
    Before(ElementId),
}

fn require<L: ElementRead + ?Sized>(list: &L, id: ElementId) -> Result<Element> {
    list.get(id)?
        .ok_or(StoreError::NotFound("collection element"))
}

/// Logical successor of `element`, or `NIL`.
pub fn logical_next<L: ElementRead + ?Sized>(list: &L, element: &Element) -> Result<ElementId> {
    match element.link.next() {
        Some(next) => Ok(next),
        None => Ok(list.key_succ(element.id)?.unwrap_or(ElementId::NIL)),
    }
}

/// Logical predecessor of `element`, or `NIL`.
pub fn logical_prev<L: ElementRead + ?Sized>(list: &L, element: &Element) -> Result<ElementId> {
    match element.link.prev() {
        Some(prev) => Ok(prev),
        None => Ok(list.key_pred(element.id)?.unwrap_or(ElementId::NIL)),
    }
}

fn set_next<L: ElementWrite + ?Sized>(list: &mut L, id: ElementId, next: ElementId) -> Result<()> {
    let mut element = require(list, id)?;
    let implicit = list.key_succ(id)?.unwrap_or(ElementId::NIL);
    let link = if implicit == next {
        element.link.with_next(None)
    } else {
        element.link.with_next(Some(next))
    };
    if link != element.link {
        element.link = link;
        list.put(element)?;
    }
    Ok(())
}

fn set_prev<L: ElementWrite + ?Sized>(list: &mut L, id: ElementId, prev: ElementId) -> Result<()> {
    let mut element = require(list, id)?;
    let implicit = list.key_pred(id)?.unwrap_or(ElementId::NIL);
    let link = if implicit == prev {
        element.link.with_prev(None)
    } else {
        element.link.with_prev(Some(prev))
    };
    if link != element.link {
        element.link = link;
        list.put(element)?;
    }
    Ok(())
}

/// Drops explicit links of `id` that now equal its key neighbours.
fn normalize<L: ElementWrite + ?Sized>(list: &mut L, id: ElementId) -> Result<()> {
    let mut element = require(list, id)?;
    let mut link = element.link;
    if let Some(next) = link.next() {
        if list.key_succ(id)?.unwrap_or(ElementId::NIL) == next {
            link = link.with_next(None);
        }
    }
    if let Some(prev) = link.prev() {
        if list.key_pred(id)?.unwrap_or(ElementId::NIL) == prev {
            link = link.with_prev(None);
        }
    }
    if link != element.link {
        element.link = link;
        list.put(element)?;
    }
    Ok(())
}

/// Makes `b` the logical successor of `a`, updating the header for `NIL`
/// endpoints.
fn join<L: ElementWrite + ?Sized>(
    list: &mut L,
    header: &mut ListHeader,
    a: ElementId,
    b: ElementId,
) -> Result<()> {
    if a.is_nil() {
        header.first = b;
    } else {
        set_next(list, a, b)?;
    }
    if b.is_nil() {
        header.last = a;
    } else {
        set_prev(list, b, a)?;
    }
    Ok(())
}

/// Pins the implicit links that inserting key `new_id` would redirect.
///
/// The key predecessor's implicit next and the key successor's implicit prev
/// would start resolving to `new_id`; both are rewritten as explicit links to
/// their current targets before the key is added.
pub fn prepare<L: ElementWrite + ?Sized>(list: &mut L, new_id: ElementId) -> Result<()> {
    let pred = list.key_pred(new_id)?;
    let succ = list.key_succ(new_id)?;
    if let Some(p) = pred {
        let mut element = require(list, p)?;
        if element.link.next().is_none() {
            element.link = element.link.with_next(Some(succ.unwrap_or(ElementId::NIL)));
            list.put(element)?;
        }
    }
    if let Some(s) = succ {
        let mut element = require(list, s)?;
        if element.link.prev().is_none() {
            element.link = element.link.with_prev(Some(pred.unwrap_or(ElementId::NIL)));
            list.put(element)?;
        }
    }
    Ok(())
}

/// Inserts `value` at `at`, using `supplied` as the id when given and the
/// generator otherwise. Returns the new element's id.
pub fn insert<L: ElementWrite + ?Sized>(
    list: &mut L,
    at: Position,
    value: ElementValue,
    supplied: Option<ElementId>,
) -> Result<ElementId> {
    let mut header = list.header();
    let (prev, next) = match at {
        Position::End => (header.last, ElementId::NIL),
        Position::Before(anchor) => {
            let anchor_el = require(list, anchor)?;
            (logical_prev(list, &anchor_el)?, anchor)
        }
    };
    let id = match supplied {
        Some(id) if id.is_nil() => return Err(StoreError::Invalid("element id must not be nil")),
        Some(id) => {
            if list.get(id)?.is_some() {
                return Err(StoreError::AlreadyExists("collection element"));
            }
            id
        }
        None => ElementId(header.next_id),
    };
    let next_id = id
        .0
        .checked_add(1)
        .ok_or(StoreError::Invalid("element id space exhausted"))?;
    prepare(list, id)?;
    list.insert_new(Element::new(id, value))?;
    join(list, &mut header, prev, id)?;
    join(list, &mut header, id, next)?;
    header.count += 1;
    header.next_id = header.next_id.max(next_id);
    list.set_header(header)?;
    Ok(id)
}

/// Unlinks and removes `id`, returning the removed element so its payload
/// can be reclaimed.
pub fn delete<L: ElementWrite + ?Sized>(list: &mut L, id: ElementId) -> Result<Element> {
    let mut header = list.header();
    let element = require(list, id)?;
    let prev = logical_prev(list, &element)?;
    let next = logical_next(list, &element)?;
    let key_pred = list.key_pred(id)?;
    let key_succ = list.key_succ(id)?;
    let removed = list.remove(id)?;
    join(list, &mut header, prev, next)?;
    for neighbour in [key_pred, key_succ].into_iter().flatten() {
        normalize(list, neighbour)?;
    }
    header.count = header
        .count
        .checked_sub(1)
        .ok_or(StoreError::Corrupted("collection count underflow"))?;
    list.set_header(header)?;
    Ok(removed)
}

/// Moves `id` immediately before `target` (`None` moves it to the end).
/// The element keeps its key, so lookups by id stay valid.
pub fn move_before<L: ElementWrite + ?Sized>(
    list: &mut L,
    id: ElementId,
    target: Option<ElementId>,
) -> Result<()> {
    let element = require(list, id)?;
    if target == Some(id) {
        return Ok(());
    }
    if let Some(t) = target {
        require(list, t)?;
    }
    let next = logical_next(list, &element)?;
    if next == target.unwrap_or(ElementId::NIL) {
        return Ok(());
    }
    let mut header = list.header();
    let prev = logical_prev(list, &element)?;
    join(list, &mut header, prev, next)?;
    let (a, b) = match target {
        None => (header.last, ElementId::NIL),
        Some(t) => {
            let target_el = require(list, t)?;
            (logical_prev(list, &target_el)?, t)
        }
    };
    join(list, &mut header, a, id)?;
    join(list, &mut header, id, b)?;
    list.set_header(header)
}

/// Replaces the payload of `id`, returning the previous payload.
pub fn replace_value<L: ElementWrite + ?Sized>(
    list: &mut L,
    id: ElementId,
    value: ElementValue,
) -> Result<ElementValue> {
    let mut element = require(list, id)?;
    let old = std::mem::replace(&mut element.value, value);
    list.put(element)?;
    Ok(old)
}

/// Element ids in logical order.
pub fn ids<L: ElementRead + ?Sized>(list: &L, direction: Direction) -> Result<Vec<ElementId>> {
    Cursor::new(list, direction)
        .map(|element| element.map(|e| e.id))
        .collect()
}
