//! Node record storage engine.
//!
//! Records live in slotted pages and hold a sorted table of property slots.
//! Large values move to the overflow store, multi-valued properties use the
//! collection engine, and every update runs through the mutation
//! orchestrator, which emits one log record per call.

/// Value encoding and decoding.
///
/// Tag words, exact encoded sizes, and overflow reference layout.
pub mod codec;

/// Ordered multi-valued properties.
///
/// Small inline collections and paged big collections sharing one link model.
pub mod collection;

/// Post-commit collaborators.
pub mod hooks;

/// Engine activity counters.
pub mod metrics;

/// Batched property mutations.
pub mod mutation;

/// Store configuration.
pub mod options;

/// Out-of-line storage for large values.
///
/// Chunk chains with streaming readers and deferred reclaim.
pub mod overflow;

/// Slotted records page.
pub mod page;

/// Record and property slot images.
pub mod record;

/// Record store facade.
pub mod store;

/// Property values.
pub mod value;

/// Record integrity check.
pub mod verify;

mod view;

pub use codec::{Decoded, LoadMode};
pub use collection::{Direction, ElementValue};
pub use hooks::{ChangeEvent, EventKind, EventLog, Notifier, StoreHooks, ViewId, ViewMaintenance, ViewOp};
pub use metrics::{CounterMetrics, NoopMetrics, StoreMetrics};
pub use mutation::{ArithOp, Mutation, MutationBatch, MutationOp, MutationOutcome};
pub use options::{OptionsError, StoreOptions};
pub use overflow::{OverflowRef, OverflowStream};
pub use record::{prop_flags, record_flags, NodeRecord, PropertySlot, SlotPayload};
pub use store::RecordStore;
pub use value::{TypeTag, Value};
pub use verify::{verify_record, VerifyReport};
pub use view::RecordView;
