use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{PageId, Result, StoreError};

/// Outcome of a reclaim request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reclaim {
    /// No reader holds the chain; the caller frees it now.
    Now,
    /// Readers are active; the last close frees the chain.
    Deferred,
}

#[derive(Debug, Default)]
struct ReaderEntry {
    readers: u32,
    pending_delete: bool,
}

/// Process-wide map of overflow start page to active reader count.
///
/// Buckets are independent mutexes keyed by page number, so registering a
/// reader never contends with the owning record's page lock.
pub struct ReaderRegistry {
    shards: Vec<Mutex<HashMap<PageId, ReaderEntry>>>,
}

impl ReaderRegistry {
    /// Creates a registry with `shards` buckets (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, start: PageId) -> &Mutex<HashMap<PageId, ReaderEntry>> {
        &self.shards[start.0 as usize % self.shards.len()]
    }

    /// Registers a reader of the chain starting at `start`.
    pub fn open(&self, start: PageId) -> Result<()> {
        let mut shard = self.shard(start).lock();
        let entry = shard.entry(start).or_default();
        if entry.pending_delete {
            return Err(StoreError::NotFound("overflow chunk pending delete"));
        }
        entry.readers += 1;
        trace!(page = start.0, readers = entry.readers, "overflow.registry.open");
        Ok(())
    }

    /// Deregisters a reader. Returns true when this was the last reader of a
    /// chain whose delete was deferred; the caller must then reclaim it.
    pub fn close(&self, start: PageId) -> Result<bool> {
        let mut shard = self.shard(start).lock();
        let entry = shard
            .get_mut(&start)
            .ok_or(StoreError::Corrupted("overflow reader closed twice"))?;
        entry.readers = entry
            .readers
            .checked_sub(1)
            .ok_or(StoreError::Corrupted("overflow reader count underflow"))?;
        trace!(page = start.0, readers = entry.readers, "overflow.registry.close");
        if entry.readers > 0 {
            return Ok(false);
        }
        let reclaim = entry.pending_delete;
        shard.remove(&start);
        Ok(reclaim)
    }

    /// Requests deletion of the chain starting at `start`. Never blocks on
    /// readers.
    pub fn request_delete(&self, start: PageId) -> Reclaim {
        let mut shard = self.shard(start).lock();
        match shard.get_mut(&start) {
            Some(entry) if entry.readers > 0 => {
                entry.pending_delete = true;
                Reclaim::Deferred
            }
            Some(_) => {
                shard.remove(&start);
                Reclaim::Now
            }
            None => Reclaim::Now,
        }
    }

    /// Current reader count of `start`.
    pub fn readers(&self, start: PageId) -> u32 {
        self.shard(start)
            .lock()
            .get(&start)
            .map_or(0, |entry| entry.readers)
    }

    /// Returns true if a delete of `start` is waiting for readers.
    pub fn is_pending_delete(&self, start: PageId) -> bool {
        self.shard(start)
            .lock()
            .get(&start)
            .is_some_and(|entry| entry.pending_delete)
    }
}
