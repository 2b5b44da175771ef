//! Identifiers, addresses, and the error taxonomy shared by every layer.

#![forbid(unsafe_code)]

use std::fmt;

pub mod checksum;
pub mod page;

pub use checksum::{value_crc32, ValueDigest};

/// Persistent identity of a node record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);

/// Property identifier; slots inside a record are sorted by this key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropId(pub u32);

/// Page number inside the page store. `PageId(0)` is never allocated and
/// terminates chains.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u32);

/// Stable identifier of one collection element, independent of its position.
/// `ElementId::NIL` marks "no neighbour" in explicit links.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ElementId(pub u32);

/// Log sequence number handed out by the page store's log writer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Physical location of a record: a page plus a slot in its directory.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RecordAddr {
    /// Page holding the record (or its forwarding stub).
    pub page: PageId,
    /// Slot directory index within the page.
    pub slot: u16,
}

impl PageId {
    /// Sentinel for "no page".
    pub const NULL: PageId = PageId(0);

    /// Returns true when this id is the null sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl ElementId {
    /// Sentinel for "no element".
    pub const NIL: ElementId = ElementId(0);

    /// Returns true when this id is the nil sentinel.
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Converts the sentinel into `None`.
    pub fn some(self) -> Option<ElementId> {
        if self.is_nil() {
            None
        } else {
            Some(self)
        }
    }
}

impl RecordAddr {
    /// Creates a record address.
    pub const fn new(page: PageId, slot: u16) -> Self {
        Self { page, slot }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RecordAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page.0, self.slot)
    }
}

impl From<u32> for PropId {
    fn from(value: u32) -> Self {
        PropId(value)
    }
}

impl From<PropId> for u32 {
    fn from(value: PropId) -> Self {
        value.0
    }
}

impl From<u32> for ElementId {
    fn from(value: u32) -> Self {
        ElementId(value)
    }
}

/// Errors surfaced by the record storage engine.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A property, element, record, or overflow chunk is missing.
    #[error("not found: {0}")]
    NotFound(&'static str),
    /// An element id is already present in the collection.
    #[error("already exists: {0}")]
    AlreadyExists(&'static str),
    /// An unexpected type tag or an inconsistent on-page layout.
    #[error("corrupted: {0}")]
    Corrupted(&'static str),
    /// The record cannot fit even after spilling and migration.
    #[error("record too big")]
    TooBig,
    /// The page store has no pages left to allocate.
    #[error("out of pages")]
    NoMemory,
    /// The store does not accept writes.
    #[error("store is read-only")]
    ReadOnly,
    /// The caller must retry; reserved for external stamp-check races.
    #[error("retry the operation")]
    Repeat,
    /// Waiting for a page lock exceeded the store-wide timeout.
    #[error("page lock wait timed out")]
    LockTimeout,
    /// The caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure of a batched mutation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{error} (operation {index:?})")]
pub struct BatchError {
    /// Index of the first operation that could not be processed, when the
    /// failure can be attributed to one.
    pub index: Option<usize>,
    /// The underlying failure.
    pub error: StoreError,
}

impl BatchError {
    /// Attributes an error to the operation at `index`.
    pub fn at(index: usize, error: StoreError) -> Self {
        Self {
            index: Some(index),
            error,
        }
    }

    /// Wraps an error that happened after classification.
    pub fn whole(error: StoreError) -> Self {
        Self { index: None, error }
    }
}

impl From<StoreError> for BatchError {
    fn from(error: StoreError) -> Self {
        Self::whole(error)
    }
}

impl From<BatchError> for StoreError {
    fn from(err: BatchError) -> Self {
        err.error
    }
}
