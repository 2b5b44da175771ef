#![forbid(unsafe_code)]
//! Per-page reader/writer locks with an upgradeable mode.
//!
//! A mutation holds [`LockMode::Upgrade`] on the record's page while it plans
//! (concurrent shared readers are still admitted) and escalates to exclusive
//! right before its log write. Every wait is bounded by the caller's timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::trace;

use crate::types::{PageId, Result, StoreError};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Requested lock strength.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Shared read access; many holders.
    Shared,
    /// Shared access that may later escalate; at most one holder, coexists
    /// with `Shared` holders.
    Upgrade,
    /// Exclusive write access.
    Exclusive,
}

enum Held {
    Shared(ArcRwLockReadGuard<RawRwLock, ()>),
    Upgrade(ArcRwLockUpgradableReadGuard<RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// A held page lock; released on drop.
pub struct PageLock {
    page: PageId,
    held: Option<Held>,
}

impl PageLock {
    /// Page this lock covers.
    pub fn page(&self) -> PageId {
        self.page
    }

    /// Current strength of the lock.
    pub fn mode(&self) -> LockMode {
        match self.held {
            Some(Held::Shared(_)) => LockMode::Shared,
            Some(Held::Upgrade(_)) => LockMode::Upgrade,
            Some(Held::Exclusive(_)) | None => LockMode::Exclusive,
        }
    }

    /// Escalates an upgradeable lock to exclusive, waiting for shared holders
    /// to drain. Exclusive locks are returned unchanged; shared locks cannot
    /// be upgraded.
    pub fn upgrade(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let held = self
            .held
            .take()
            .ok_or(StoreError::Corrupted("page lock already released"))?;
        let mut pending = match held {
            Held::Upgrade(guard) => guard,
            Held::Exclusive(guard) => {
                self.held = Some(Held::Exclusive(guard));
                return Ok(());
            }
            Held::Shared(guard) => {
                self.held = Some(Held::Shared(guard));
                return Err(StoreError::Invalid("shared page locks cannot be upgraded"));
            }
        };
        loop {
            match ArcRwLockUpgradableReadGuard::try_upgrade(pending) {
                Ok(exclusive) => {
                    self.held = Some(Held::Exclusive(exclusive));
                    trace!(page = self.page.0, "lock.upgrade");
                    return Ok(());
                }
                Err(guard) => {
                    if Instant::now() >= deadline {
                        self.held = Some(Held::Upgrade(guard));
                        return Err(StoreError::LockTimeout);
                    }
                    pending = guard;
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
            }
        }
    }
}

/// Table of page locks created on demand.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<HashMap<PageId, Arc<RwLock<()>>>>,
}

impl LockTable {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, page: PageId) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(page).or_default())
    }

    /// Acquires `page` in `mode`, giving up with [`StoreError::LockTimeout`]
    /// once `timeout` elapses.
    pub fn acquire(&self, page: PageId, mode: LockMode, timeout: Duration) -> Result<PageLock> {
        let lock = self.entry(page);
        let deadline = Instant::now() + timeout;
        loop {
            let held = match mode {
                LockMode::Shared => lock.try_read_arc().map(Held::Shared),
                LockMode::Upgrade => lock.try_upgradable_read_arc().map(Held::Upgrade),
                LockMode::Exclusive => lock.try_write_arc().map(Held::Exclusive),
            };
            if let Some(held) = held {
                return Ok(PageLock {
                    page,
                    held: Some(held),
                });
            }
            if Instant::now() >= deadline {
                trace!(page = page.0, ?mode, "lock.timeout");
                return Err(StoreError::LockTimeout);
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }
}
