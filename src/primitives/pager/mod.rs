#![forbid(unsafe_code)]
//! Page store collaborator consumed by the record engine.
//!
//! The engine never writes a page buffer directly: it stages edits in a
//! [`PageTxn`] and hands the finished before/after images to
//! [`PageStore::write_log_record`], which applies them atomically.

mod mem;
mod txn;

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{Lsn, NodeId, PageId, PropId, Result};

pub use crate::primitives::concurrency::{LockMode, PageLock};
pub use mem::{LoggedRecord, MemPager};
pub use txn::{PageBytes, PageTxn};

/// Immutable snapshot of a committed page.
#[derive(Clone)]
pub struct PageRef {
    /// Page identifier.
    pub id: PageId,
    data: Arc<[u8]>,
}

impl PageRef {
    /// Wraps page bytes.
    pub fn new(id: PageId, data: Arc<[u8]>) -> Self {
        Self { id, data }
    }

    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Deref for PageRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// Kind of change a log record describes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogOp {
    /// Property modifications of one record (the per-call record).
    Mutate,
    /// Copy of an unmodified record onto a freshly allocated page.
    Migrate,
    /// Physical removal of a soft-deleted record.
    Purge,
    /// Release of a page committed by an earlier record whose call failed.
    Rollback,
}

/// Before/after image of one page.
#[derive(Clone, Debug)]
pub struct PageImage {
    /// Page being written.
    pub page: PageId,
    /// Contents before the write; empty for newly allocated pages.
    pub before: Vec<u8>,
    /// Contents after the write.
    pub after: Vec<u8>,
}

/// Before/after image of one property slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropImage {
    /// Record owning the property.
    pub node: NodeId,
    /// Property being modified.
    pub prop: PropId,
    /// Encoded slot before the change; empty for pure inserts.
    pub before: Vec<u8>,
    /// Encoded slot after the change; empty for pure deletes.
    pub after: Vec<u8>,
}

/// One multi-part transactional write.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// What the record describes.
    pub op: LogOp,
    /// Page images applied atomically.
    pub pages: Vec<PageImage>,
    /// Logical property images carried alongside the page images.
    pub props: Vec<PropImage>,
    /// Committed pages returned to the free pool once the images apply.
    pub freed: Vec<PageId>,
}

/// Read access to pages, either committed or staged in a transaction.
pub trait PageRead {
    /// Returns the bytes of page `id`.
    fn read_page(&self, id: PageId) -> Result<PageBytes<'_>>;
}

impl PageRead for PageTxn {
    fn read_page(&self, id: PageId) -> Result<PageBytes<'_>> {
        self.page(id)
    }
}

impl PageRead for dyn PageStore {
    fn read_page(&self, id: PageId) -> Result<PageBytes<'_>> {
        Ok(PageBytes::Stored(self.get_page(id)?))
    }
}

/// Backend providing page buffers, locking, allocation, and log writes.
pub trait PageStore: Send + Sync + 'static {
    /// Returns the page size in bytes.
    fn page_size(&self) -> usize;
    /// Returns a snapshot of a committed page.
    fn get_page(&self, id: PageId) -> Result<PageRef>;
    /// Acquires a lock on `id`, bounded by `timeout`.
    fn lock(&self, id: PageId, mode: LockMode, timeout: Duration) -> Result<PageLock>;
    /// Reserves a page number. The page has no contents until a log record
    /// writes it.
    fn allocate_page(&self) -> Result<PageId>;
    /// Returns a page to the free pool, making it reusable.
    fn free_page(&self, id: PageId) -> Result<()>;
    /// Returns true if the page is currently allocated.
    fn is_allocated(&self, id: PageId) -> bool;
    /// Applies every page image of `record` atomically, releases its freed
    /// pages, and appends it to the log.
    fn write_log_record(&self, record: LogRecord) -> Result<Lsn>;
    /// Returns true if the store rejects writes.
    fn read_only(&self) -> bool {
        false
    }
}
