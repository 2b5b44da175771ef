//! Low-level primitives the record engine is built on.
//!
//! Includes byte utilities, page locks, and the page store seam.

/// Byte-level utilities and encoding/decoding.
///
/// Checked fixed-width and varint accessors over page buffers.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// Per-page upgradeable locks with bounded waits.
pub mod concurrency;

/// Page store collaborator.
///
/// The `PageStore` trait, its in-memory implementation, and transaction staging.
pub mod pager;
