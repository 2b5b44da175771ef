use crate::primitives::bytes::be;
use crate::types::{ElementId, Result, StoreError};

use super::{Element, ElementRead, ElementWrite, ListHeader};

const DESCRIPTOR_LEN: usize = 2 + 4 + 4 + 4;

/// Inline collection: a key-sorted element array stored in the record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SmallCollection {
    header: ListHeader,
    elements: Vec<Element>,
}

impl SmallCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Elements in key order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub(crate) fn elements_mut(&mut self) -> &mut [Element] {
        &mut self.elements
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true if the collection holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Splits into header and key-ordered elements.
    pub fn into_parts(self) -> (ListHeader, Vec<Element>) {
        (self.header, self.elements)
    }

    /// Exact encoded length.
    pub fn encoded_size(&self) -> usize {
        DESCRIPTOR_LEN + self.elements.iter().map(Element::encoded_size).sum::<usize>()
    }

    fn position(&self, id: ElementId) -> std::result::Result<usize, usize> {
        self.elements.binary_search_by_key(&id, |e| e.id)
    }

    /// Encodes the collection at `off`, returning the bytes written.
    pub fn encode(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        let count = u16::try_from(self.elements.len())
            .map_err(|_| StoreError::Invalid("small collection too long"))?;
        be::put_u16(buf, off, count)?;
        be::put_u32(buf, off + 2, self.header.next_id)?;
        be::put_u32(buf, off + 6, self.header.first.0)?;
        be::put_u32(buf, off + 10, self.header.last.0)?;
        let mut cursor = off + DESCRIPTOR_LEN;
        for element in &self.elements {
            cursor += element.encode(buf, cursor)?;
        }
        Ok(cursor - off)
    }

    /// Decodes a collection at `*off`, advancing it.
    pub fn decode(buf: &[u8], off: &mut usize) -> Result<Self> {
        let count = be::get_u16(buf, *off)? as usize;
        let header = ListHeader {
            count: count as u32,
            next_id: be::get_u32(buf, *off + 2)?,
            first: ElementId(be::get_u32(buf, *off + 6)?),
            last: ElementId(be::get_u32(buf, *off + 10)?),
        };
        let mut cursor = *off + DESCRIPTOR_LEN;
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            let element = Element::decode(buf, &mut cursor)?;
            if elements.last().is_some_and(|prev: &Element| prev.id >= element.id) {
                return Err(StoreError::Corrupted("small collection keys out of order"));
            }
            if element.id.0 >= header.next_id {
                return Err(StoreError::Corrupted("element id beyond generator"));
            }
            elements.push(element);
        }
        *off = cursor;
        Ok(Self { header, elements })
    }
}

impl ElementRead for SmallCollection {
    fn header(&self) -> ListHeader {
        self.header
    }

    fn get(&self, id: ElementId) -> Result<Option<Element>> {
        Ok(self.position(id).ok().map(|pos| self.elements[pos].clone()))
    }

    fn key_succ(&self, id: ElementId) -> Result<Option<ElementId>> {
        let pos = match self.position(id) {
            Ok(pos) => pos + 1,
            Err(pos) => pos,
        };
        Ok(self.elements.get(pos).map(|e| e.id))
    }

    fn key_pred(&self, id: ElementId) -> Result<Option<ElementId>> {
        let pos = match self.position(id) {
            Ok(pos) | Err(pos) => pos,
        };
        Ok(pos.checked_sub(1).map(|p| self.elements[p].id))
    }
}

impl ElementWrite for SmallCollection {
    fn put(&mut self, element: Element) -> Result<()> {
        let pos = self
            .position(element.id)
            .map_err(|_| StoreError::NotFound("collection element"))?;
        self.elements[pos] = element;
        Ok(())
    }

    fn insert_new(&mut self, element: Element) -> Result<()> {
        match self.position(element.id) {
            Ok(_) => Err(StoreError::AlreadyExists("collection element")),
            Err(pos) => {
                self.elements.insert(pos, element);
                Ok(())
            }
        }
    }

    fn remove(&mut self, id: ElementId) -> Result<Element> {
        let pos = self
            .position(id)
            .map_err(|_| StoreError::NotFound("collection element"))?;
        Ok(self.elements.remove(pos))
    }

    fn set_header(&mut self, header: ListHeader) -> Result<()> {
        self.header = header;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{insert, ElementValue, Position};
    use super::*;
    use crate::storage::value::Value;

    #[test]
    fn encode_decode_preserves_links_and_header() -> Result<()> {
        let mut list = SmallCollection::new();
        for v in 0..4 {
            insert(&mut list, Position::End, ElementValue::Inline(Value::Int(v)), None)?;
        }
        insert(
            &mut list,
            Position::Before(ElementId(1)),
            ElementValue::Inline(Value::Str("head".into())),
            None,
        )?;
        let mut buf = vec![0u8; list.encoded_size() + 3];
        let written = list.encode(&mut buf, 3)?;
        assert_eq!(written, list.encoded_size());
        let mut off = 3;
        let decoded = SmallCollection::decode(&buf, &mut off)?;
        assert_eq!(decoded, list);
        assert_eq!(off, 3 + written);
        Ok(())
    }

    #[test]
    fn key_neighbours_of_absent_ids() -> Result<()> {
        let mut list = SmallCollection::new();
        for id in [2u32, 4, 6] {
            list.insert_new(Element::new(ElementId(id), ElementValue::Inline(Value::Null)))?;
        }
        assert_eq!(list.key_succ(ElementId(3))?, Some(ElementId(4)));
        assert_eq!(list.key_pred(ElementId(3))?, Some(ElementId(2)));
        assert_eq!(list.key_pred(ElementId(2))?, None);
        assert_eq!(list.key_succ(ElementId(6))?, None);
        Ok(())
    }
}
