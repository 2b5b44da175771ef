//! Mutable record storage engine for an embedded graph/document store.
//!
//! Node records live in slotted pages. Large values spill to write-once
//! overflow chains, multi-valued properties are kept as ordered collections
//! (inline or paged), and every update is planned and written as one
//! transactional log record by the mutation orchestrator.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;
