use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::Arc;

use tracing::{trace, warn};

use super::{LogOp, LogRecord, PageImage, PageRef, PageStore, PropImage};
use crate::types::{Lsn, PageId, Result, StoreError};

/// Bytes of a page as seen by a transaction: its own staged copy when it has
/// one, the committed snapshot otherwise.
pub enum PageBytes<'a> {
    /// Staged by this transaction.
    Dirty(&'a [u8]),
    /// Committed snapshot from the page store.
    Stored(PageRef),
}

impl Deref for PageBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            PageBytes::Dirty(bytes) => bytes,
            PageBytes::Stored(page) => page.data(),
        }
    }
}

/// Staging area for the page edits of one log record.
///
/// Nothing reaches the page store until [`PageTxn::commit`]. Dropping an
/// uncommitted transaction returns every page it allocated.
pub struct PageTxn {
    store: Arc<dyn PageStore>,
    dirty: BTreeMap<PageId, Vec<u8>>,
    originals: HashMap<PageId, Vec<u8>>,
    allocated: Vec<PageId>,
    freed: Vec<PageId>,
    props: Vec<PropImage>,
    committed: bool,
}

impl PageTxn {
    /// Starts an empty transaction against `store`.
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            dirty: BTreeMap::new(),
            originals: HashMap::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
            props: Vec::new(),
            committed: false,
        }
    }

    /// Page store this transaction writes to.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Page size of the underlying store.
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Reads a page, preferring this transaction's staged copy.
    pub fn page(&self, id: PageId) -> Result<PageBytes<'_>> {
        if self.freed.contains(&id) {
            return Err(StoreError::NotFound("page freed in transaction"));
        }
        match self.dirty.get(&id) {
            Some(bytes) => Ok(PageBytes::Dirty(bytes)),
            None => Ok(PageBytes::Stored(self.store.get_page(id)?)),
        }
    }

    /// Returns a writable copy of the page, staging it on first access.
    pub fn page_mut(&mut self, id: PageId) -> Result<&mut Vec<u8>> {
        if self.freed.contains(&id) {
            return Err(StoreError::NotFound("page freed in transaction"));
        }
        if !self.dirty.contains_key(&id) {
            let current = self.store.get_page(id)?;
            self.originals.insert(id, current.data().to_vec());
            self.dirty.insert(id, current.data().to_vec());
        }
        self.dirty
            .get_mut(&id)
            .ok_or(StoreError::Corrupted("staged page vanished"))
    }

    /// Allocates a page and stages a zeroed buffer for it.
    pub fn allocate(&mut self) -> Result<PageId> {
        let id = self.store.allocate_page()?;
        self.allocated.push(id);
        self.originals.insert(id, Vec::new());
        self.dirty.insert(id, vec![0u8; self.store.page_size()]);
        trace!(page = id.0, "txn.allocate");
        Ok(id)
    }

    /// Frees a page. Pages allocated by this transaction are returned
    /// immediately; committed pages are freed once the commit succeeds.
    pub fn free(&mut self, id: PageId) -> Result<()> {
        self.dirty.remove(&id);
        self.originals.remove(&id);
        if let Some(pos) = self.allocated.iter().position(|p| *p == id) {
            self.allocated.swap_remove(pos);
            return self.store.free_page(id);
        }
        if !self.freed.contains(&id) {
            self.freed.push(id);
        }
        Ok(())
    }

    /// Attaches a property before/after image to the log record.
    pub fn record_prop(&mut self, image: PropImage) {
        self.props.push(image);
    }

    /// Pages allocated by this transaction so far.
    pub fn allocated(&self) -> &[PageId] {
        &self.allocated
    }

    /// Number of staged page images.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Writes every staged page and every page freed during the transaction
    /// as one log record.
    pub fn commit(mut self, op: LogOp) -> Result<Lsn> {
        if self.store.read_only() {
            return Err(StoreError::ReadOnly);
        }
        let dirty = std::mem::take(&mut self.dirty);
        let mut pages = Vec::with_capacity(dirty.len());
        for (page, after) in dirty {
            let before = self.originals.remove(&page).unwrap_or_default();
            pages.push(PageImage {
                page,
                before,
                after,
            });
        }
        let record = LogRecord {
            op,
            pages,
            props: std::mem::take(&mut self.props),
            freed: std::mem::take(&mut self.freed),
        };
        let lsn = self.store.write_log_record(record)?;
        self.committed = true;
        trace!(lsn = lsn.0, ?op, "txn.commit");
        Ok(lsn)
    }
}

impl Drop for PageTxn {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for page in self.allocated.drain(..) {
            if let Err(err) = self.store.free_page(page) {
                warn!(page = page.0, ?err, "txn.rollback.free_failed");
            }
        }
    }
}
