//! Paged form of a collection.
//!
//! Elements live in leaf pages sorted by id and chained through prev/next
//! sibling pointers. The descriptor stored in the record holds a fan-out
//! array of `(max_key, page)` entries; at `level == 0` those point at leaves,
//! otherwise at index pages with the same entry layout. A key routes to the
//! first entry whose `max_key` is at least the key, or to the last entry.

use crate::primitives::bytes::be;
use crate::primitives::pager::{PageRead, PageTxn};
use crate::types::page::{init_page, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{ElementId, PageId, Result, StoreError};
use tracing::{debug, trace};

use super::{Element, ElementRead, ElementWrite, ListHeader, SmallCollection};
use crate::storage::overflow::OverflowRef;

/// Fixed bytes of an encoded descriptor before the fan-out array.
pub const DESCRIPTOR_FIXED_LEN: usize = 4 + 4 + 2 + 4 + 4 + 4 + 4 + 2;
const ENTRY_LEN: usize = 8;

mod leaf {
    use super::PAGE_HDR_LEN;

    pub const COUNT: usize = PAGE_HDR_LEN;
    pub const PREV: usize = PAGE_HDR_LEN + 4;
    pub const NEXT: usize = PAGE_HDR_LEN + 8;
    pub const ELEMENTS: usize = PAGE_HDR_LEN + 12;
}

mod index {
    use super::PAGE_HDR_LEN;

    pub const COUNT: usize = PAGE_HDR_LEN;
    pub const ENTRIES: usize = PAGE_HDR_LEN + 4;
}

/// Bytes an index page needs for `entries` fan-out entries.
pub fn index_page_len(entries: usize) -> usize {
    index::ENTRIES + entries * ENTRY_LEN
}

/// Bytes of leaf page header before the first element.
pub const LEAF_HDR_END: usize = leaf::ELEMENTS;

/// One fan-out entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FanoutEntry {
    /// Upper bound of the keys routed to `page`.
    pub max_key: u32,
    /// Child page (leaf or index).
    pub page: PageId,
}

/// Record-resident descriptor of a big collection.
#[derive(Clone, Debug, PartialEq)]
pub struct BigDescriptor {
    /// First leaf in key order.
    pub leftmost: PageId,
    /// Last leaf in key order; appends land here.
    pub anchor: PageId,
    /// Index levels between the descriptor and the leaves.
    pub level: u16,
    /// Count, generator, and logical endpoints.
    pub header: ListHeader,
    /// Root fan-out.
    pub fanout: Vec<FanoutEntry>,
}

impl BigDescriptor {
    /// Exact encoded length.
    pub fn encoded_size(&self) -> usize {
        DESCRIPTOR_FIXED_LEN + self.fanout.len() * ENTRY_LEN
    }

    /// Encodes the descriptor at `off`, returning the bytes written.
    pub fn encode(&self, buf: &mut [u8], off: usize) -> Result<usize> {
        be::put_u32(buf, off, self.leftmost.0)?;
        be::put_u32(buf, off + 4, self.anchor.0)?;
        be::put_u16(buf, off + 8, self.level)?;
        be::put_u32(buf, off + 10, self.header.count)?;
        be::put_u32(buf, off + 14, self.header.next_id)?;
        be::put_u32(buf, off + 18, self.header.first.0)?;
        be::put_u32(buf, off + 22, self.header.last.0)?;
        let entries = u16::try_from(self.fanout.len())
            .map_err(|_| StoreError::Invalid("fan-out array too long"))?;
        be::put_u16(buf, off + 26, entries)?;
        let mut cursor = off + DESCRIPTOR_FIXED_LEN;
        for entry in &self.fanout {
            be::put_u32(buf, cursor, entry.max_key)?;
            be::put_u32(buf, cursor + 4, entry.page.0)?;
            cursor += ENTRY_LEN;
        }
        Ok(cursor - off)
    }

    /// Decodes a descriptor at `*off`, advancing it.
    pub fn decode(buf: &[u8], off: &mut usize) -> Result<Self> {
        let base = *off;
        let entries = be::get_u16(buf, base + 26)? as usize;
        if entries == 0 {
            return Err(StoreError::Corrupted("big collection without fan-out"));
        }
        let mut fanout = Vec::with_capacity(entries);
        let mut cursor = base + DESCRIPTOR_FIXED_LEN;
        for _ in 0..entries {
            fanout.push(FanoutEntry {
                max_key: be::get_u32(buf, cursor)?,
                page: PageId(be::get_u32(buf, cursor + 4)?),
            });
            cursor += ENTRY_LEN;
        }
        *off = cursor;
        Ok(Self {
            leftmost: PageId(be::get_u32(buf, base)?),
            anchor: PageId(be::get_u32(buf, base + 4)?),
            level: be::get_u16(buf, base + 8)?,
            header: ListHeader {
                count: be::get_u32(buf, base + 10)?,
                next_id: be::get_u32(buf, base + 14)?,
                first: ElementId(be::get_u32(buf, base + 18)?),
                last: ElementId(be::get_u32(buf, base + 22)?),
            },
            fanout,
        })
    }
}

#[derive(Clone, Debug, Default)]
struct Leaf {
    prev: PageId,
    next: PageId,
    elements: Vec<Element>,
}

impl Leaf {
    fn encoded_size(&self) -> usize {
        leaf::ELEMENTS + self.elements.iter().map(Element::encoded_size).sum::<usize>()
    }

    fn position(&self, id: ElementId) -> std::result::Result<usize, usize> {
        self.elements.binary_search_by_key(&id, |e| e.id)
    }
}

fn read_leaf<R: PageRead + ?Sized>(pages: &R, id: PageId) -> Result<Leaf> {
    let data = pages.read_page(id)?;
    PageHeader::expect(&data, id, PageKind::CollectionLeaf)?;
    let count = be::get_u16(&data, leaf::COUNT)? as usize;
    let mut elements = Vec::with_capacity(count);
    let mut cursor = leaf::ELEMENTS;
    for _ in 0..count {
        elements.push(Element::decode(&data, &mut cursor)?);
    }
    Ok(Leaf {
        prev: PageId(be::get_u32(&data, leaf::PREV)?),
        next: PageId(be::get_u32(&data, leaf::NEXT)?),
        elements,
    })
}

fn write_leaf(txn: &mut PageTxn, id: PageId, node: &Leaf) -> Result<()> {
    let count = u16::try_from(node.elements.len())
        .map_err(|_| StoreError::Corrupted("leaf element count overflow"))?;
    let buf = txn.page_mut(id)?;
    if node.encoded_size() > buf.len() {
        return Err(StoreError::TooBig);
    }
    init_page(buf, id, PageKind::CollectionLeaf)?;
    be::put_u16(buf, leaf::COUNT, count)?;
    be::put_u32(buf, leaf::PREV, node.prev.0)?;
    be::put_u32(buf, leaf::NEXT, node.next.0)?;
    let mut cursor = leaf::ELEMENTS;
    for element in &node.elements {
        cursor += element.encode(buf, cursor)?;
    }
    Ok(())
}

fn read_index<R: PageRead + ?Sized>(pages: &R, id: PageId) -> Result<Vec<FanoutEntry>> {
    let data = pages.read_page(id)?;
    PageHeader::expect(&data, id, PageKind::CollectionIndex)?;
    let count = be::get_u16(&data, index::COUNT)? as usize;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let off = index::ENTRIES + i * ENTRY_LEN;
        entries.push(FanoutEntry {
            max_key: be::get_u32(&data, off)?,
            page: PageId(be::get_u32(&data, off + 4)?),
        });
    }
    Ok(entries)
}

fn write_index(txn: &mut PageTxn, id: PageId, entries: &[FanoutEntry]) -> Result<()> {
    let count = u16::try_from(entries.len())
        .map_err(|_| StoreError::Corrupted("index entry count overflow"))?;
    let buf = txn.page_mut(id)?;
    if index_page_len(entries.len()) > buf.len() {
        return Err(StoreError::Invalid("fan-out does not fit an index page"));
    }
    init_page(buf, id, PageKind::CollectionIndex)?;
    be::put_u16(buf, index::COUNT, count)?;
    for (i, entry) in entries.iter().enumerate() {
        let off = index::ENTRIES + i * ENTRY_LEN;
        be::put_u32(buf, off, entry.max_key)?;
        be::put_u32(buf, off + 4, entry.page.0)?;
    }
    Ok(())
}

fn route_index(entries: &[FanoutEntry], key: u32) -> Result<usize> {
    if entries.is_empty() {
        return Err(StoreError::Corrupted("empty collection index"));
    }
    Ok(entries
        .iter()
        .position(|e| e.max_key >= key)
        .unwrap_or(entries.len() - 1))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Node {
    Root,
    Index(PageId),
}

type Path = Vec<(Node, usize)>;

/// Read-only keyed access to a big collection through any page source.
pub struct BigView<'a, R: PageRead + ?Sized> {
    pages: &'a R,
    desc: &'a BigDescriptor,
}

impl<'a, R: PageRead + ?Sized> BigView<'a, R> {
    /// Wraps a descriptor and the pages it points into.
    pub fn new(pages: &'a R, desc: &'a BigDescriptor) -> Self {
        Self { pages, desc }
    }

    fn entries(&self, node: Node) -> Result<Vec<FanoutEntry>> {
        match node {
            Node::Root => Ok(self.desc.fanout.clone()),
            Node::Index(page) => read_index(self.pages, page),
        }
    }

    fn route(&self, id: ElementId) -> Result<(Path, PageId)> {
        let mut path = Vec::with_capacity(self.desc.level as usize + 1);
        let mut node = Node::Root;
        for depth in 0..=self.desc.level {
            let entries = self.entries(node)?;
            let idx = route_index(&entries, id.0)?;
            path.push((node, idx));
            let child = entries[idx].page;
            if depth == self.desc.level {
                return Ok((path, child));
            }
            node = Node::Index(child);
        }
        Err(StoreError::Corrupted("collection index deeper than level"))
    }

    /// Every page (index and leaf) the collection occupies.
    pub fn pages(&self) -> Result<Vec<PageId>> {
        let mut out = Vec::new();
        let mut frontier: Vec<(PageId, u16)> =
            self.desc.fanout.iter().map(|e| (e.page, 0)).collect();
        while let Some((page, depth)) = frontier.pop() {
            out.push(page);
            if depth < self.desc.level {
                for entry in read_index(self.pages, page)? {
                    frontier.push((entry.page, depth + 1));
                }
            }
        }
        Ok(out)
    }

    /// Leaf pages from leftmost to anchor.
    pub fn leaves(&self) -> Result<Vec<PageId>> {
        let mut out = Vec::new();
        let mut current = self.desc.leftmost;
        while !current.is_null() {
            if out.contains(&current) {
                return Err(StoreError::Corrupted("leaf sibling cycle"));
            }
            out.push(current);
            current = read_leaf(self.pages, current)?.next;
        }
        if out.last() != Some(&self.desc.anchor) {
            return Err(StoreError::Corrupted("leaf chain does not end at anchor"));
        }
        Ok(out)
    }

    /// All elements in key order.
    pub fn elements(&self) -> Result<Vec<Element>> {
        let mut out = Vec::with_capacity(self.desc.header.count as usize);
        for page in self.leaves()? {
            out.extend(read_leaf(self.pages, page)?.elements);
        }
        Ok(out)
    }

    /// Overflow references held by elements.
    pub fn overflow_refs(&self) -> Result<Vec<OverflowRef>> {
        Ok(self
            .elements()?
            .into_iter()
            .filter_map(|e| e.value.overflow().copied())
            .collect())
    }
}

impl<R: PageRead + ?Sized> ElementRead for BigView<'_, R> {
    fn header(&self) -> ListHeader {
        self.desc.header
    }

    fn get(&self, id: ElementId) -> Result<Option<Element>> {
        let (_, page) = self.route(id)?;
        let node = read_leaf(self.pages, page)?;
        Ok(node.position(id).ok().map(|pos| node.elements[pos].clone()))
    }

    fn key_succ(&self, id: ElementId) -> Result<Option<ElementId>> {
        let (_, page) = self.route(id)?;
        let mut node = read_leaf(self.pages, page)?;
        if let Some(e) = node.elements.iter().find(|e| e.id > id) {
            return Ok(Some(e.id));
        }
        while !node.next.is_null() {
            node = read_leaf(self.pages, node.next)?;
            if let Some(e) = node.elements.first() {
                return Ok(Some(e.id));
            }
        }
        Ok(None)
    }

    fn key_pred(&self, id: ElementId) -> Result<Option<ElementId>> {
        let (_, page) = self.route(id)?;
        let mut node = read_leaf(self.pages, page)?;
        if let Some(e) = node.elements.iter().rev().find(|e| e.id < id) {
            return Ok(Some(e.id));
        }
        while !node.prev.is_null() {
            node = read_leaf(self.pages, node.prev)?;
            if let Some(e) = node.elements.last() {
                return Ok(Some(e.id));
            }
        }
        Ok(None)
    }
}

/// Writable big collection bound to the transaction that stages its pages.
pub struct BigHandle<'a> {
    txn: &'a mut PageTxn,
    desc: &'a mut BigDescriptor,
    fanout_max: usize,
}

impl<'a> BigHandle<'a> {
    /// Binds `desc` to `txn`. Nodes holding more than `fanout_max` entries
    /// are split.
    pub fn new(txn: &'a mut PageTxn, desc: &'a mut BigDescriptor, fanout_max: usize) -> Self {
        Self {
            txn,
            desc,
            fanout_max: fanout_max.max(2),
        }
    }

    fn view(&self) -> BigView<'_, PageTxn> {
        BigView::new(&*self.txn, &*self.desc)
    }

    fn load_entries(&self, node: Node) -> Result<Vec<FanoutEntry>> {
        self.view().entries(node)
    }

    fn store_entries(&mut self, node: Node, entries: Vec<FanoutEntry>) -> Result<()> {
        match node {
            Node::Root => {
                self.desc.fanout = entries;
                Ok(())
            }
            Node::Index(page) => write_index(self.txn, page, &entries),
        }
    }

    fn raise_bounds(&mut self, path: &[(Node, usize)], key: u32) -> Result<()> {
        for &(node, idx) in path {
            let mut entries = self.load_entries(node)?;
            if entries[idx].max_key < key {
                entries[idx].max_key = key;
                self.store_entries(node, entries)?;
            }
        }
        Ok(())
    }

    fn store_leaf(&mut self, path: &[(Node, usize)], page: PageId, mut node: Leaf) -> Result<()> {
        let capacity = self.txn.page_size();
        if node.encoded_size() <= capacity {
            return write_leaf(self.txn, page, &node);
        }
        if node.elements.len() < 2 {
            return Err(StoreError::TooBig);
        }
        let half = node.encoded_size() / 2;
        let mut acc = leaf::ELEMENTS;
        let mut mid = 0;
        while mid < node.elements.len() - 1 && acc + node.elements[mid].encoded_size() <= half {
            acc += node.elements[mid].encoded_size();
            mid += 1;
        }
        let mid = mid.max(1);
        let right_id = self.txn.allocate()?;
        let right = Leaf {
            prev: page,
            next: node.next,
            elements: node.elements.split_off(mid),
        };
        if !node.next.is_null() {
            let mut after = read_leaf(&*self.txn, node.next)?;
            after.prev = right_id;
            write_leaf(self.txn, node.next, &after)?;
        }
        node.next = right_id;
        write_leaf(self.txn, page, &node)?;
        write_leaf(self.txn, right_id, &right)?;
        if self.desc.anchor == page {
            self.desc.anchor = right_id;
        }
        let left_max = node
            .elements
            .last()
            .map(|e| e.id.0)
            .ok_or(StoreError::Corrupted("split produced empty leaf"))?;
        trace!(left = page.0, right = right_id.0, "collection.leaf.split");
        self.insert_entry(path, left_max, right_id)
    }

    fn insert_entry(&mut self, path: &[(Node, usize)], left_max: u32, right: PageId) -> Result<()> {
        let (&(node, idx), parents) = path
            .split_last()
            .ok_or(StoreError::Corrupted("empty collection path"))?;
        let mut entries = self.load_entries(node)?;
        let old_max = entries[idx].max_key;
        entries[idx].max_key = left_max;
        entries.insert(
            idx + 1,
            FanoutEntry {
                max_key: old_max,
                page: right,
            },
        );
        if entries.len() <= self.fanout_max {
            return self.store_entries(node, entries);
        }
        let mid = entries.len() / 2;
        let upper = entries.split_off(mid);
        let lower_max = entries[mid - 1].max_key;
        match node {
            Node::Root => {
                let left_page = self.txn.allocate()?;
                let right_page = self.txn.allocate()?;
                write_index(self.txn, left_page, &entries)?;
                write_index(self.txn, right_page, &upper)?;
                let upper_max = upper[upper.len() - 1].max_key;
                self.desc.fanout = vec![
                    FanoutEntry {
                        max_key: lower_max,
                        page: left_page,
                    },
                    FanoutEntry {
                        max_key: upper_max,
                        page: right_page,
                    },
                ];
                self.desc.level += 1;
                debug!(level = self.desc.level, "collection.root.split");
                Ok(())
            }
            Node::Index(page) => {
                let sibling = self.txn.allocate()?;
                write_index(self.txn, page, &entries)?;
                write_index(self.txn, sibling, &upper)?;
                trace!(left = page.0, right = sibling.0, "collection.index.split");
                self.insert_entry(parents, lower_max, sibling)
            }
        }
    }

    fn unlink_leaf(&mut self, path: &[(Node, usize)], page: PageId, node: Leaf) -> Result<()> {
        if node.prev.is_null() {
            self.desc.leftmost = node.next;
        } else {
            let mut before = read_leaf(&*self.txn, node.prev)?;
            before.next = node.next;
            write_leaf(self.txn, node.prev, &before)?;
        }
        if node.next.is_null() {
            self.desc.anchor = node.prev;
        } else {
            let mut after = read_leaf(&*self.txn, node.next)?;
            after.prev = node.prev;
            write_leaf(self.txn, node.next, &after)?;
        }
        self.txn.free(page)?;
        trace!(page = page.0, "collection.leaf.remove");
        self.remove_entry(path)
    }

    fn remove_entry(&mut self, path: &[(Node, usize)]) -> Result<()> {
        let (&(node, idx), parents) = path
            .split_last()
            .ok_or(StoreError::Corrupted("empty collection path"))?;
        let mut entries = self.load_entries(node)?;
        entries.remove(idx);
        if !entries.is_empty() {
            return self.store_entries(node, entries);
        }
        match node {
            Node::Root => Err(StoreError::Corrupted("big collection lost its last leaf")),
            Node::Index(page) => {
                self.txn.free(page)?;
                self.remove_entry(parents)
            }
        }
    }
}

impl ElementRead for BigHandle<'_> {
    fn header(&self) -> ListHeader {
        self.desc.header
    }

    fn get(&self, id: ElementId) -> Result<Option<Element>> {
        self.view().get(id)
    }

    fn key_succ(&self, id: ElementId) -> Result<Option<ElementId>> {
        self.view().key_succ(id)
    }

    fn key_pred(&self, id: ElementId) -> Result<Option<ElementId>> {
        self.view().key_pred(id)
    }
}

impl ElementWrite for BigHandle<'_> {
    fn put(&mut self, element: Element) -> Result<()> {
        let (path, page) = self.view().route(element.id)?;
        let mut node = read_leaf(&*self.txn, page)?;
        let pos = node
            .position(element.id)
            .map_err(|_| StoreError::NotFound("collection element"))?;
        node.elements[pos] = element;
        self.store_leaf(&path, page, node)
    }

    fn insert_new(&mut self, element: Element) -> Result<()> {
        let (path, page) = self.view().route(element.id)?;
        let mut node = read_leaf(&*self.txn, page)?;
        let pos = match node.position(element.id) {
            Ok(_) => return Err(StoreError::AlreadyExists("collection element")),
            Err(pos) => pos,
        };
        self.raise_bounds(&path, element.id.0)?;
        node.elements.insert(pos, element);
        self.store_leaf(&path, page, node)
    }

    fn remove(&mut self, id: ElementId) -> Result<Element> {
        let (path, page) = self.view().route(id)?;
        let mut node = read_leaf(&*self.txn, page)?;
        let pos = node
            .position(id)
            .map_err(|_| StoreError::NotFound("collection element"))?;
        let removed = node.elements.remove(pos);
        if node.elements.is_empty() && self.desc.leftmost != self.desc.anchor {
            self.unlink_leaf(&path, page, node)?;
        } else {
            write_leaf(self.txn, page, &node)?;
        }
        Ok(removed)
    }

    fn set_header(&mut self, header: ListHeader) -> Result<()> {
        self.desc.header = header;
        Ok(())
    }
}

/// Converts a small collection into paged form, preserving ids, links, and
/// the generator.
pub fn promote(txn: &mut PageTxn, small: SmallCollection, fanout_max: usize) -> Result<BigDescriptor> {
    let (header, elements) = small.into_parts();
    let leaf_page = txn.allocate()?;
    write_leaf(txn, leaf_page, &Leaf::default())?;
    let mut desc = BigDescriptor {
        leftmost: leaf_page,
        anchor: leaf_page,
        level: 0,
        header,
        fanout: vec![FanoutEntry {
            max_key: 0,
            page: leaf_page,
        }],
    };
    let moved = elements.len();
    {
        let mut handle = BigHandle::new(txn, &mut desc, fanout_max);
        for element in elements {
            handle.insert_new(element)?;
        }
    }
    debug!(elements = moved, leaves = desc.fanout.len(), "collection.promote");
    Ok(desc)
}

/// Frees every page of a big collection in `txn`, returning the overflow
/// references its elements held.
pub fn release(txn: &mut PageTxn, desc: &BigDescriptor) -> Result<Vec<OverflowRef>> {
    let (pages, refs) = {
        let view = BigView::new(&*txn, desc);
        (view.pages()?, view.overflow_refs()?)
    };
    for page in pages {
        txn.free(page)?;
    }
    Ok(refs)
}
