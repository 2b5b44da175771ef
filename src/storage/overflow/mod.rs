#![forbid(unsafe_code)]
//! Out-of-line storage for values too large to keep in a record.
//!
//! A value is written once as a chain of chunk pages and never edited in
//! place. Readers register with the [`ReaderRegistry`] for the chain's start
//! page; a delete that races with readers is parked as pending and performed
//! by the last reader to close.

mod registry;

use std::cmp::min;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::primitives::bytes::be;
use crate::primitives::pager::{PageRead, PageStore, PageTxn};
use crate::types::page::{init_page, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{value_crc32, PageId, Result, StoreError, ValueDigest};

use super::value::TypeTag;

pub use registry::{Reclaim, ReaderRegistry};

/// Bytes of the chunk header following the common page header.
pub const CHUNK_HDR_LEN: usize = 20;

mod chunk {
    //! Byte offsets of the chunk header fields.
    use super::PAGE_HDR_LEN;

    pub const NEXT: usize = PAGE_HDR_LEN;
    pub const USED: usize = PAGE_HDR_LEN + 4;
    pub const TYPE_TAG: usize = PAGE_HDR_LEN + 8;
    pub const FLAGS: usize = PAGE_HDR_LEN + 9;
    pub const TOTAL_LEN: usize = PAGE_HDR_LEN + 12;
    pub const DATA: usize = PAGE_HDR_LEN + super::CHUNK_HDR_LEN;
}

/// Slot payload pointing at an overflowed value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OverflowRef {
    /// First chunk page of the chain.
    pub start: PageId,
    /// Type of the stored value.
    pub tag: TypeTag,
    /// Total byte length of the value.
    pub len: u64,
    /// CRC32 of the value bytes.
    pub checksum: u32,
}

#[derive(Debug)]
struct ChunkHeader {
    next: PageId,
    used: usize,
    total_len: u64,
}

/// Counters describing overflow activity.
#[derive(Default)]
pub struct OverflowMetrics {
    chunks_written: AtomicU64,
    chunks_freed: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    deferred_reclaims: AtomicU64,
}

/// Point-in-time copy of [`OverflowMetrics`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OverflowMetricsSnapshot {
    /// Chunks made durable by committed writes.
    pub chunks_written: u64,
    /// Chunks returned to the page store.
    pub chunks_freed: u64,
    /// Value bytes made durable by committed writes.
    pub bytes_written: u64,
    /// Value bytes copied out by readers.
    pub bytes_read: u64,
    /// Deletes that had to wait for readers.
    pub deferred_reclaims: u64,
}

impl OverflowMetricsSnapshot {
    /// Chunks currently holding live values.
    pub fn live_chunks(&self) -> i64 {
        self.chunks_written as i64 - self.chunks_freed as i64
    }
}

impl OverflowMetrics {
    /// Creates a snapshot of the current counters.
    pub fn snapshot(&self) -> OverflowMetricsSnapshot {
        OverflowMetricsSnapshot {
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            chunks_freed: self.chunks_freed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            deferred_reclaims: self.deferred_reclaims.load(Ordering::Relaxed),
        }
    }

    fn add(counter: &AtomicU64, delta: u64) {
        if delta != 0 {
            counter.fetch_add(delta, Ordering::Relaxed);
        }
    }
}

struct Shared {
    store: Arc<dyn PageStore>,
    registry: ReaderRegistry,
    metrics: OverflowMetrics,
    data_capacity: usize,
}

impl Shared {
    fn decode_chunk(&self, data: &[u8], id: PageId, tag: TypeTag) -> Result<ChunkHeader> {
        PageHeader::expect(data, id, PageKind::Overflow)?;
        let stored = TypeTag::from_u8(be::get_u8(data, chunk::TYPE_TAG)?)?;
        if stored != tag {
            return Err(StoreError::Corrupted("overflow type tag mismatch"));
        }
        let used = be::get_u32(data, chunk::USED)? as usize;
        if used > self.data_capacity {
            return Err(StoreError::Corrupted("overflow chunk length exceeds capacity"));
        }
        Ok(ChunkHeader {
            next: PageId(be::get_u32(data, chunk::NEXT)?),
            used,
            total_len: be::get_u64(data, chunk::TOTAL_LEN)?,
        })
    }

    fn chain<R: PageRead + ?Sized>(&self, pages: &R, r: &OverflowRef) -> Result<Vec<PageId>> {
        let expected = chunk_count(r.len, self.data_capacity);
        let mut out = Vec::with_capacity(expected);
        let mut current = r.start;
        while !current.is_null() {
            if out.len() >= expected {
                return Err(StoreError::Corrupted("overflow chain longer than value"));
            }
            let page = pages.read_page(current)?;
            let header = self.decode_chunk(&page, current, r.tag)?;
            out.push(current);
            current = header.next;
        }
        if out.len() != expected {
            return Err(StoreError::Corrupted("overflow chain shorter than value"));
        }
        Ok(out)
    }

    fn reclaim(&self, r: &OverflowRef) -> Result<()> {
        let pages = self.chain(&*self.store, r)?;
        for page in &pages {
            self.store.free_page(*page)?;
        }
        OverflowMetrics::add(&self.metrics.chunks_freed, pages.len() as u64);
        debug!(page = r.start.0, chunks = pages.len(), "overflow.reclaim");
        Ok(())
    }
}

fn chunk_count(len: u64, capacity: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(capacity as u64) as usize
    }
}

/// Overflow chunk manager shared by every record of a store.
#[derive(Clone)]
pub struct OverflowStore {
    shared: Arc<Shared>,
}

impl OverflowStore {
    /// Creates an overflow store over `store` with a registry of
    /// `registry_shards` buckets.
    pub fn new(store: Arc<dyn PageStore>, registry_shards: usize) -> Result<Self> {
        let page_size = store.page_size();
        if page_size <= chunk::DATA {
            return Err(StoreError::Invalid("page size too small for overflow chunks"));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                registry: ReaderRegistry::new(registry_shards),
                metrics: OverflowMetrics::default(),
                data_capacity: page_size - chunk::DATA,
            }),
        })
    }

    /// Value bytes one chunk holds.
    pub fn data_capacity(&self) -> usize {
        self.shared.data_capacity
    }

    /// Number of chunks a value of `len` bytes occupies.
    pub fn chunks_for(&self, len: u64) -> usize {
        chunk_count(len, self.shared.data_capacity)
    }

    /// Reader registry guarding reclaim.
    pub fn registry(&self) -> &ReaderRegistry {
        &self.shared.registry
    }

    /// Returns a snapshot of the overflow counters.
    pub fn metrics(&self) -> OverflowMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Stages a new chunk chain holding `bytes` in `txn`.
    pub fn write(&self, txn: &mut PageTxn, tag: TypeTag, bytes: &[u8]) -> Result<OverflowRef> {
        if !tag.is_blob() {
            return Err(StoreError::Invalid("only strings and bytes overflow"));
        }
        let capacity = self.shared.data_capacity;
        let total = bytes.len() as u64;
        let needed = chunk_count(total, capacity);
        let mut pages = Vec::with_capacity(needed);
        for _ in 0..needed {
            pages.push(txn.allocate()?);
        }
        let mut checksum = ValueDigest::new();
        let mut offset = 0usize;
        for (idx, page_id) in pages.iter().enumerate() {
            let next = pages.get(idx + 1).copied().unwrap_or(PageId::NULL);
            let chunk_len = min(bytes.len() - offset, capacity);
            let payload = &bytes[offset..offset + chunk_len];
            checksum.update(payload);
            let buf = txn.page_mut(*page_id)?;
            init_page(buf, *page_id, PageKind::Overflow)?;
            be::put_u32(buf, chunk::NEXT, next.0)?;
            be::put_u32(buf, chunk::USED, chunk_len as u32)?;
            be::put_bytes(buf, chunk::TYPE_TAG, &[tag.as_u8()])?;
            be::put_bytes(buf, chunk::FLAGS, &[0])?;
            be::put_u64(buf, chunk::TOTAL_LEN, total)?;
            be::put_bytes(buf, chunk::DATA, payload)?;
            offset += chunk_len;
        }
        trace!(chunks = pages.len(), len = total, "overflow.write");
        Ok(OverflowRef {
            start: pages[0],
            tag,
            len: total,
            checksum: checksum.finish(),
        })
    }

    /// Accounts chains whose staging transaction committed.
    pub fn note_committed(&self, refs: &[OverflowRef]) {
        for r in refs {
            OverflowMetrics::add(&self.shared.metrics.chunks_written, self.chunks_for(r.len) as u64);
            OverflowMetrics::add(&self.shared.metrics.bytes_written, r.len);
        }
    }

    /// Frees a chain staged by `txn` that never became durable.
    pub fn discard(&self, txn: &mut PageTxn, r: &OverflowRef) -> Result<()> {
        let pages = self.shared.chain(&*txn, r)?;
        for page in pages {
            txn.free(page)?;
        }
        trace!(page = r.start.0, "overflow.discard");
        Ok(())
    }

    /// Lists the chunk pages of `r` as seen through `pages`.
    pub fn chain_pages<R: PageRead + ?Sized>(&self, pages: &R, r: &OverflowRef) -> Result<Vec<PageId>> {
        self.shared.chain(pages, r)
    }

    /// Opens a streaming reader; the chain cannot be reclaimed until the
    /// stream is closed or dropped.
    pub fn open(&self, r: &OverflowRef) -> Result<OverflowStream> {
        self.shared.registry.open(r.start)?;
        let mut stream = OverflowStream {
            shared: Arc::clone(&self.shared),
            r: *r,
            cursor: ChainCursor::start(r.start),
            open: true,
        };
        let checked = self
            .shared
            .store
            .get_page(r.start)
            .and_then(|page| self.shared.decode_chunk(&page, r.start, r.tag));
        match checked {
            Ok(header) if header.total_len == r.len => Ok(stream),
            Ok(_) => {
                stream.finish()?;
                Err(StoreError::Corrupted("overflow length mismatch"))
            }
            Err(err) => {
                stream.finish()?;
                Err(err)
            }
        }
    }

    /// Reads a whole value and verifies its checksum.
    pub fn read_value(&self, r: &OverflowRef) -> Result<Vec<u8>> {
        let mut stream = self.open(r)?;
        let bytes = stream.read_to_end()?;
        stream.close()?;
        if value_crc32(&bytes) != r.checksum {
            return Err(StoreError::Corrupted("overflow checksum mismatch"));
        }
        Ok(bytes)
    }

    /// Reads a value through `pages`, which may hold chunks staged by an
    /// uncommitted transaction. No reader is registered.
    pub fn read_value_in<R: PageRead + ?Sized>(&self, pages: &R, r: &OverflowRef) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(r.len as usize);
        for id in self.shared.chain(pages, r)? {
            let page = pages.read_page(id)?;
            let header = self.shared.decode_chunk(&page, id, r.tag)?;
            out.extend_from_slice(be::get_bytes(&page, chunk::DATA, header.used)?);
        }
        if out.len() as u64 != r.len || value_crc32(&out) != r.checksum {
            return Err(StoreError::Corrupted("overflow checksum mismatch"));
        }
        Ok(out)
    }

    /// Releases a committed chain that is no longer referenced. The chain is
    /// freed now, or by the last active reader.
    pub fn release(&self, r: &OverflowRef) -> Result<Reclaim> {
        match self.shared.registry.request_delete(r.start) {
            Reclaim::Now => {
                self.shared.reclaim(r)?;
                Ok(Reclaim::Now)
            }
            Reclaim::Deferred => {
                OverflowMetrics::add(&self.shared.metrics.deferred_reclaims, 1);
                debug!(page = r.start.0, readers = self.shared.registry.readers(r.start), "overflow.reclaim.deferred");
                Ok(Reclaim::Deferred)
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ChainCursor {
    page: PageId,
    offset_in_chunk: usize,
    position: u64,
}

impl ChainCursor {
    fn start(page: PageId) -> Self {
        Self {
            page,
            offset_in_chunk: 0,
            position: 0,
        }
    }
}

/// Sequential reader over one overflow chain.
pub struct OverflowStream {
    shared: Arc<Shared>,
    r: OverflowRef,
    cursor: ChainCursor,
    open: bool,
}

impl OverflowStream {
    /// Reference this stream reads.
    pub fn overflow_ref(&self) -> &OverflowRef {
        &self.r
    }

    /// Total length of the value.
    pub fn len(&self) -> u64 {
        self.r.len
    }

    /// Returns true for an empty value.
    pub fn is_empty(&self) -> bool {
        self.r.len == 0
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.cursor.position
    }

    fn fill(&self, cursor: &mut ChainCursor, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() && cursor.position < self.r.len {
            if cursor.page.is_null() {
                return Err(StoreError::Corrupted("overflow chain terminated early"));
            }
            let page = self.shared.store.get_page(cursor.page)?;
            let header = self.shared.decode_chunk(&page, cursor.page, self.r.tag)?;
            if cursor.offset_in_chunk >= header.used {
                if header.used == 0 {
                    return Err(StoreError::Corrupted("empty chunk inside overflow chain"));
                }
                cursor.page = header.next;
                cursor.offset_in_chunk = 0;
                continue;
            }
            let n = min(header.used - cursor.offset_in_chunk, buf.len() - filled);
            let src = be::get_bytes(&page, chunk::DATA + cursor.offset_in_chunk, n)?;
            buf[filled..filled + n].copy_from_slice(src);
            filled += n;
            cursor.offset_in_chunk += n;
            cursor.position += n as u64;
        }
        OverflowMetrics::add(&self.shared.metrics.bytes_read, filled as u64);
        Ok(filled)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Invalid("overflow stream is closed"))
        }
    }

    /// Copies up to `buf.len()` bytes, returning fewer only at end of value.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let mut cursor = self.cursor;
        let n = self.fill(&mut cursor, buf)?;
        self.cursor = cursor;
        Ok(n)
    }

    /// Reads starting at `offset` by walking the chain from its start; the
    /// sequential position is unchanged.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if offset >= self.r.len {
            return Ok(0);
        }
        let mut cursor = ChainCursor::start(self.r.start);
        let mut skip = offset;
        while skip > 0 {
            let page = self.shared.store.get_page(cursor.page)?;
            let header = self.shared.decode_chunk(&page, cursor.page, self.r.tag)?;
            let used = header.used as u64;
            if skip >= used {
                skip -= used;
                cursor.position += used;
                cursor.page = header.next;
                if cursor.page.is_null() {
                    return Err(StoreError::Corrupted("overflow chain terminated early"));
                }
            } else {
                cursor.offset_in_chunk = skip as usize;
                cursor.position += skip;
                skip = 0;
            }
        }
        self.fill(&mut cursor, buf)
    }

    /// Rewinds to the first byte.
    pub fn reset(&mut self) {
        self.cursor = ChainCursor::start(self.r.start);
    }

    /// Reads every remaining byte.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self.r.len.saturating_sub(self.cursor.position) as usize;
        let mut out = vec![0u8; remaining];
        let n = self.read(&mut out)?;
        if n != remaining {
            return Err(StoreError::Corrupted("overflow chain shorter than value"));
        }
        Ok(out)
    }

    /// Deregisters the reader, reclaiming the chain if a delete was waiting.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        if self.shared.registry.close(self.r.start)? {
            self.shared.reclaim(&self.r)?;
        }
        Ok(())
    }
}

impl Drop for OverflowStream {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(page = self.r.start.0, ?err, "overflow.stream.close_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::pager::{LogOp, MemPager};

    fn setup(page_size: usize) -> (Arc<MemPager>, Arc<dyn PageStore>, OverflowStore) {
        let mem = Arc::new(MemPager::new(page_size, None));
        let store: Arc<dyn PageStore> = mem.clone();
        let overflow = OverflowStore::new(Arc::clone(&store), 4).unwrap();
        (mem, store, overflow)
    }

    fn committed(store: &Arc<dyn PageStore>, overflow: &OverflowStore, bytes: &[u8]) -> Result<OverflowRef> {
        let mut txn = PageTxn::new(Arc::clone(store));
        let r = overflow.write(&mut txn, TypeTag::Bytes, bytes)?;
        txn.commit(LogOp::Mutate)?;
        overflow.note_committed(&[r]);
        Ok(r)
    }

    #[test]
    fn multi_chunk_value_reads_back() -> Result<()> {
        let (_mem, store, overflow) = setup(128);
        let bytes: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let r = committed(&store, &overflow, &bytes)?;
        assert_eq!(overflow.chain_pages(&*store, &r)?.len(), overflow.chunks_for(1000));
        assert_eq!(overflow.read_value(&r)?, bytes);
        let mut stream = overflow.open(&r)?;
        let mut buf = [0u8; 10];
        assert_eq!(stream.read_at(995, &mut buf)?, 5);
        assert_eq!(&buf[..5], &bytes[995..]);
        assert_eq!(stream.position(), 0);
        Ok(())
    }

    #[test]
    fn release_with_reader_is_deferred_until_close() -> Result<()> {
        let (mem, store, overflow) = setup(64);
        let r = committed(&store, &overflow, &[7u8; 100])?;
        let before = mem.live_pages();
        let stream = overflow.open(&r)?;
        assert_eq!(overflow.release(&r)?, Reclaim::Deferred);
        assert_eq!(mem.live_pages(), before);
        assert!(overflow.open(&r).is_err());
        stream.close()?;
        assert_eq!(mem.live_pages(), before - overflow.chunks_for(100));
        assert_eq!(overflow.metrics().live_chunks(), 0);
        assert_eq!(overflow.metrics().deferred_reclaims, 1);
        Ok(())
    }

    #[test]
    fn type_mismatch_and_missing_chain() -> Result<()> {
        let (_mem, store, overflow) = setup(64);
        let r = committed(&store, &overflow, b"hello overflow")?;
        let wrong = OverflowRef { tag: TypeTag::Str, ..r };
        assert_eq!(
            overflow.open(&wrong).err(),
            Some(StoreError::Corrupted("overflow type tag mismatch"))
        );
        assert_eq!(overflow.release(&r)?, Reclaim::Now);
        assert!(matches!(overflow.open(&r), Err(StoreError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn reset_rereads_identical_bytes() -> Result<()> {
        let (_mem, store, overflow) = setup(96);
        let bytes: Vec<u8> = (0..300u16).map(|i| (i * 7) as u8).collect();
        let r = committed(&store, &overflow, &bytes)?;
        let mut stream = overflow.open(&r)?;
        let first = stream.read_to_end()?;
        stream.reset();
        let second = stream.read_to_end()?;
        assert_eq!(first, second);
        assert_eq!(first, bytes);
        Ok(())
    }
}
