#![forbid(unsafe_code)]
//! Mutation orchestrator.
//!
//! A call runs four phases against a working copy of the record:
//! `classify` applies the operations and collects one accumulator per
//! property, `plan` decides spills, promotions, and whether the record must
//! migrate, and `apply` writes the pages and commits exactly one `Mutate`
//! log record (preceded by one `Migrate` record when the record moves). Side
//! effects run only after the commit succeeds.

mod apply;
mod arith;
mod classify;
mod plan;

use crate::types::{ElementId, Lsn, PropId, RecordAddr};

use super::value::Value;

pub use arith::ArithOp;

pub(crate) use apply::{commit_flags, run_create, run_mutate};

/// Operation applied to one property.
#[derive(Clone, Debug, PartialEq)]
pub enum MutationOp {
    /// Replaces the property value, or the element value when an element id
    /// is given.
    Set(Value),
    /// Appends an element; the mutation's element id, when given, is used as
    /// the new id.
    Add(Value),
    /// Inserts an element before `anchor`.
    AddBefore {
        /// Element the new one is placed before.
        anchor: ElementId,
        /// Element payload.
        value: Value,
    },
    /// Removes the property, or one element when an element id is given.
    Delete,
    /// Moves the property to a new id.
    Rename(PropId),
    /// Moves an element before `before`, or to the end for `None`.
    Move {
        /// Target the element is placed before.
        before: Option<ElementId>,
    },
    /// Combines the current numeric value with `operand`.
    Combine {
        /// Operator.
        op: ArithOp,
        /// Right-hand operand.
        operand: Value,
    },
}

/// One entry of a [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    /// Property addressed.
    pub prop: PropId,
    /// What to do.
    pub op: MutationOp,
    /// Element addressed, or the id to assign for `Add` / `AddBefore`.
    pub element: Option<ElementId>,
    /// Slot flags to store after the operation.
    pub flags: Option<u8>,
}

/// Ordered sequence of operations applied atomically to one record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationBatch {
    ops: Vec<Mutation>,
    force_split: bool,
}

impl MutationBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations in submission order.
    pub fn ops(&self) -> &[Mutation] {
        &self.ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns true if spill selection runs in force-split mode.
    pub fn is_force_split(&self) -> bool {
        self.force_split
    }

    /// Appends a raw mutation.
    pub fn push(mut self, mutation: Mutation) -> Self {
        self.ops.push(mutation);
        self
    }

    fn op(self, prop: PropId, op: MutationOp, element: Option<ElementId>) -> Self {
        self.push(Mutation {
            prop,
            op,
            element,
            flags: None,
        })
    }

    /// Sets a property value.
    pub fn set(self, prop: PropId, value: impl Into<Value>) -> Self {
        self.op(prop, MutationOp::Set(value.into()), None)
    }

    /// Replaces one element's value.
    pub fn set_element(self, prop: PropId, element: ElementId, value: impl Into<Value>) -> Self {
        self.op(prop, MutationOp::Set(value.into()), Some(element))
    }

    /// Appends an element with a generated id.
    pub fn add(self, prop: PropId, value: impl Into<Value>) -> Self {
        self.op(prop, MutationOp::Add(value.into()), None)
    }

    /// Appends an element with a caller-chosen id.
    pub fn add_with_id(self, prop: PropId, id: ElementId, value: impl Into<Value>) -> Self {
        self.op(prop, MutationOp::Add(value.into()), Some(id))
    }

    /// Inserts an element before `anchor`.
    pub fn add_before(self, prop: PropId, anchor: ElementId, value: impl Into<Value>) -> Self {
        self.op(
            prop,
            MutationOp::AddBefore {
                anchor,
                value: value.into(),
            },
            None,
        )
    }

    /// Removes a property.
    pub fn delete(self, prop: PropId) -> Self {
        self.op(prop, MutationOp::Delete, None)
    }

    /// Removes one element.
    pub fn delete_element(self, prop: PropId, element: ElementId) -> Self {
        self.op(prop, MutationOp::Delete, Some(element))
    }

    /// Renames a property.
    pub fn rename(self, prop: PropId, to: PropId) -> Self {
        self.op(prop, MutationOp::Rename(to), None)
    }

    /// Moves `element` before `before` (`None` moves it to the end).
    pub fn move_before(self, prop: PropId, element: ElementId, before: Option<ElementId>) -> Self {
        self.op(prop, MutationOp::Move { before }, Some(element))
    }

    /// Combines a property (or one element) with `operand`.
    pub fn combine(
        self,
        prop: PropId,
        element: Option<ElementId>,
        op: ArithOp,
        operand: impl Into<Value>,
    ) -> Self {
        self.op(
            prop,
            MutationOp::Combine {
                op,
                operand: operand.into(),
            },
            element,
        )
    }

    /// Sets the slot flags of the last pushed operation's property.
    pub fn with_flags(mut self, flags: u8) -> Self {
        if let Some(last) = self.ops.last_mut() {
            last.flags = Some(flags);
        }
        self
    }

    /// Runs spill selection even when the record already fits.
    pub fn force_split(mut self) -> Self {
        self.force_split = true;
        self
    }
}

/// Result of a committed mutation call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Address the record lives at after the call.
    pub addr: RecordAddr,
    /// Sequence number of the `Mutate` log record.
    pub lsn: Lsn,
    /// Sequence number of the `Migrate` log record, when the record moved.
    pub migrate_lsn: Option<Lsn>,
    /// Properties whose values were moved to the overflow store.
    pub spilled: Vec<PropId>,
    /// Properties promoted to big collections.
    pub promoted: Vec<PropId>,
    /// Ids assigned by `Add` / `AddBefore`, in operation order.
    pub assigned: Vec<ElementId>,
    /// Property images carried by the log record.
    pub parts: usize,
}

impl MutationOutcome {
    /// Returns true if the record moved to a new page.
    pub fn migrated(&self) -> bool {
        self.migrate_lsn.is_some()
    }
}
