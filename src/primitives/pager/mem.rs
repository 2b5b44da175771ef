use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{LogOp, LogRecord, PageRef, PageStore, PropImage};
use crate::primitives::concurrency::{LockMode, LockTable, PageLock};
use crate::types::{Lsn, PageId, Result, StoreError};

enum PageState {
    Free,
    Reserved,
    Written(Arc<[u8]>),
}

/// Summary of one applied log record, kept for inspection.
#[derive(Clone, Debug)]
pub struct LoggedRecord {
    /// Sequence number assigned at write time.
    pub lsn: Lsn,
    /// Opcode of the record.
    pub op: LogOp,
    /// Pages the record wrote, in order.
    pub pages: Vec<PageId>,
    /// Property images carried by the record.
    pub props: Vec<PropImage>,
    /// Pages the record released.
    pub freed: Vec<PageId>,
}

struct MemState {
    pages: Vec<PageState>,
    free: Vec<PageId>,
    log: Vec<LoggedRecord>,
    next_lsn: u64,
}

impl MemState {
    fn state(&self, id: PageId) -> Option<&PageState> {
        if id.is_null() {
            return None;
        }
        self.pages.get(id.0 as usize)
    }

    fn live_pages(&self) -> usize {
        self.pages
            .iter()
            .skip(1)
            .filter(|page| !matches!(page, PageState::Free))
            .count()
    }
}

/// In-memory page store with a retained log.
pub struct MemPager {
    page_size: usize,
    max_pages: Option<u32>,
    state: Mutex<MemState>,
    locks: LockTable,
    injected_failure: Mutex<Option<(usize, StoreError)>>,
    read_only: AtomicBool,
}

impl MemPager {
    /// Creates an empty store with `page_size` byte pages and an optional
    /// allocation budget.
    pub fn new(page_size: usize, max_pages: Option<u32>) -> Self {
        Self {
            page_size,
            max_pages,
            state: Mutex::new(MemState {
                // Page 0 is the null sentinel and is never handed out.
                pages: vec![PageState::Free],
                free: Vec::new(),
                log: Vec::new(),
                next_lsn: 1,
            }),
            locks: LockTable::new(),
            injected_failure: Mutex::new(None),
            read_only: AtomicBool::new(false),
        }
    }

    /// Makes the next [`PageStore::write_log_record`] fail with `err` without
    /// applying anything.
    pub fn fail_next_write(&self, err: StoreError) {
        self.fail_write_after(0, err);
    }

    /// Lets the next `skip` log writes through, then fails the one after
    /// with `err`.
    pub fn fail_write_after(&self, skip: usize, err: StoreError) {
        *self.injected_failure.lock() = Some((skip, err));
    }

    fn take_injected_failure(&self) -> Option<StoreError> {
        let mut injected = self.injected_failure.lock();
        match injected.as_mut() {
            Some((0, _)) => injected.take().map(|(_, err)| err),
            Some((skip, _)) => {
                *skip -= 1;
                None
            }
            None => None,
        }
    }

    /// Switches the store between read-only and read-write.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Returns every record written so far.
    pub fn log(&self) -> Vec<LoggedRecord> {
        self.state.lock().log.clone()
    }

    /// Number of records written so far.
    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Number of pages currently allocated (reserved or written).
    pub fn live_pages(&self) -> usize {
        self.state.lock().live_pages()
    }
}

impl PageStore for MemPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn get_page(&self, id: PageId) -> Result<PageRef> {
        let state = self.state.lock();
        match state.state(id) {
            Some(PageState::Written(data)) => Ok(PageRef::new(id, Arc::clone(data))),
            Some(PageState::Reserved) => Err(StoreError::NotFound("page not written")),
            _ => Err(StoreError::NotFound("page not allocated")),
        }
    }

    fn lock(&self, id: PageId, mode: LockMode, timeout: Duration) -> Result<PageLock> {
        self.locks.acquire(id, mode, timeout)
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            state.pages[id.0 as usize] = PageState::Reserved;
            trace!(page = id.0, reused = true, "pager.allocate");
            return Ok(id);
        }
        let next = state.pages.len();
        if let Some(max) = self.max_pages {
            if state.live_pages() >= max as usize {
                return Err(StoreError::NoMemory);
            }
        }
        let id = PageId(u32::try_from(next).map_err(|_| StoreError::NoMemory)?);
        state.pages.push(PageState::Reserved);
        trace!(page = id.0, reused = false, "pager.allocate");
        Ok(id)
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        match state.state(id) {
            Some(PageState::Reserved) | Some(PageState::Written(_)) => {}
            _ => return Err(StoreError::NotFound("page not allocated")),
        }
        state.pages[id.0 as usize] = PageState::Free;
        state.free.push(id);
        trace!(page = id.0, "pager.free");
        Ok(())
    }

    fn is_allocated(&self, id: PageId) -> bool {
        matches!(
            self.state.lock().state(id),
            Some(PageState::Reserved) | Some(PageState::Written(_))
        )
    }

    fn write_log_record(&self, record: LogRecord) -> Result<Lsn> {
        if self.read_only() {
            return Err(StoreError::ReadOnly);
        }
        if let Some(err) = self.take_injected_failure() {
            debug!(?err, op = ?record.op, "pager.write_log_record.injected_failure");
            return Err(err);
        }
        let mut state = self.state.lock();
        for image in &record.pages {
            if image.after.len() != self.page_size {
                return Err(StoreError::Invalid("page image has wrong length"));
            }
            match state.state(image.page) {
                Some(PageState::Reserved) => {}
                Some(PageState::Written(current)) => {
                    if !image.before.is_empty() && image.before.as_slice() != &current[..] {
                        return Err(StoreError::Corrupted("log before-image mismatch"));
                    }
                }
                _ => return Err(StoreError::NotFound("log record targets unallocated page")),
            }
        }
        for page in &record.freed {
            if record.pages.iter().any(|image| image.page == *page) {
                return Err(StoreError::Invalid("log record writes a page it frees"));
            }
            if !matches!(state.state(*page), Some(PageState::Reserved | PageState::Written(_))) {
                return Err(StoreError::NotFound("log record frees unallocated page"));
            }
        }
        let lsn = Lsn(state.next_lsn);
        state.next_lsn += 1;
        let mut pages = Vec::with_capacity(record.pages.len());
        for image in record.pages {
            pages.push(image.page);
            state.pages[image.page.0 as usize] = PageState::Written(Arc::from(image.after));
        }
        for page in &record.freed {
            state.pages[page.0 as usize] = PageState::Free;
            state.free.push(*page);
        }
        trace!(
            lsn = lsn.0,
            op = ?record.op,
            pages = pages.len(),
            props = record.props.len(),
            freed = record.freed.len(),
            "pager.write_log_record"
        );
        state.log.push(LoggedRecord {
            lsn,
            op: record.op,
            pages,
            props: record.props,
            freed: record.freed,
        });
        Ok(lsn)
    }

    fn read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}
