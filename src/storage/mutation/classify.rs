use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::trace;

use crate::primitives::pager::PageTxn;
use crate::storage::codec;
use crate::storage::collection::{
    self, big, BigHandle, ElementValue, ElementWrite, Position, SmallCollection,
};
use crate::storage::hooks::{ChangeEvent, EventKind};
use crate::storage::overflow::OverflowRef;
use crate::storage::record::{prop_flags, NodeRecord, PropertySlot, SlotPayload};
use crate::storage::store::StoreContext;
use crate::storage::value::Value;
use crate::types::{BatchError, ElementId, PropId, Result, StoreError};

use super::arith;
use super::{Mutation, MutationBatch, MutationOp};

const NO_PROPERTY: StoreError = StoreError::NotFound("property");
const NOT_COLLECTION: StoreError = StoreError::Invalid("property is not a collection");

/// Everything one call did to one property.
pub(super) struct PropAcc {
    /// Slot at the start of the call.
    pub before: Option<PropertySlot>,
    /// Net change in element count.
    pub element_delta: i64,
    /// Element-level notifications for full-text collections.
    pub events: SmallVec<[ChangeEvent; 2]>,
}

/// Working state produced by classification and refined by placement.
pub(super) struct Classified {
    pub record: NodeRecord,
    pub accs: BTreeMap<PropId, PropAcc>,
    /// Chains staged in this call that the working record still references.
    pub written: Vec<OverflowRef>,
    /// Committed chains to release once the call commits.
    pub evicted: SmallVec<[OverflowRef; 4]>,
    pub assigned: Vec<ElementId>,
}

impl Classified {
    pub(super) fn new(original: &NodeRecord) -> Self {
        Self {
            record: original.clone(),
            accs: BTreeMap::new(),
            written: Vec::new(),
            evicted: SmallVec::new(),
            assigned: Vec::new(),
        }
    }

    /// Accumulator of `prop`, created on first touch.
    pub(super) fn touch(&mut self, prop: PropId, original: &NodeRecord) -> &mut PropAcc {
        self.accs.entry(prop).or_insert_with(|| PropAcc {
            before: original.slot(prop).cloned(),
            element_delta: 0,
            events: SmallVec::new(),
        })
    }

    /// Drops a reference the working record no longer holds.
    pub(super) fn evict_ref(&mut self, ctx: &StoreContext, txn: &mut PageTxn, r: OverflowRef) -> Result<()> {
        if txn.allocated().contains(&r.start) {
            ctx.overflow.discard(txn, &r)?;
            self.written.retain(|w| w.start != r.start);
        } else {
            self.evicted.push(r);
        }
        Ok(())
    }

    pub(super) fn evict(&mut self, ctx: &StoreContext, txn: &mut PageTxn, payload: SlotPayload) -> Result<()> {
        let refs = match payload {
            SlotPayload::Big(desc) => big::release(txn, &desc)?,
            other => other.overflow_refs(),
        };
        for r in refs {
            self.evict_ref(ctx, txn, r)?;
        }
        Ok(())
    }

    /// Stages a blob in the overflow store.
    pub(super) fn spill(&mut self, ctx: &StoreContext, txn: &mut PageTxn, value: &Value) -> Result<OverflowRef> {
        let bytes = value
            .blob()
            .ok_or(StoreError::Invalid("only strings and bytes overflow"))?;
        let r = ctx.overflow.write(txn, value.tag(), bytes)?;
        self.written.push(r);
        Ok(r)
    }
}

fn inline_of(value: &ElementValue) -> Option<Value> {
    match value {
        ElementValue::Inline(v) => Some(v.clone()),
        ElementValue::Overflow(_) => None,
    }
}

struct Classifier<'a> {
    ctx: &'a StoreContext,
    txn: &'a mut PageTxn,
    original: &'a NodeRecord,
    out: Classified,
}

impl Classifier<'_> {
    fn with_list<T>(
        &mut self,
        prop: PropId,
        f: impl FnOnce(&mut dyn ElementWrite) -> Result<T>,
    ) -> Result<T> {
        let fanout = self.ctx.options.big_fanout_max as usize;
        let slot = self.out.record.slot_mut(prop).ok_or(NO_PROPERTY)?;
        match &mut slot.payload {
            SlotPayload::Small(list) => f(list),
            SlotPayload::Big(desc) => {
                let mut handle = BigHandle::new(&mut *self.txn, desc, fanout);
                f(&mut handle)
            }
            SlotPayload::Inline(_) | SlotPayload::Overflow(_) => Err(NOT_COLLECTION),
        }
    }

    fn is_fulltext(&self, prop: PropId) -> bool {
        self.out
            .record
            .slot(prop)
            .is_some_and(|s| s.flags & prop_flags::FULLTEXT != 0)
    }

    fn element_value(&mut self, value: Value) -> Result<ElementValue> {
        let large = value.blob().is_some()
            && (codec::encoded_size(&value) > self.ctx.options.element_inline_limit as usize
                || !codec::fits_inline(&value));
        if large {
            let r = self.out.spill(self.ctx, self.txn, &value)?;
            Ok(ElementValue::Overflow(r))
        } else {
            Ok(ElementValue::Inline(value))
        }
    }

    fn element_event(
        &mut self,
        prop: PropId,
        element: ElementId,
        old: Option<Value>,
        new: Option<Value>,
    ) {
        if !self.is_fulltext(prop) {
            return;
        }
        let node = self.out.record.node;
        self.out.touch(prop, self.original).events.push(ChangeEvent {
            kind: EventKind::IndexedValueChanged,
            node,
            prop: Some(prop),
            element: Some(element),
            old,
            new,
        });
    }

    fn insert(&mut self, m: &Mutation, at: Option<ElementId>, value: Value) -> Result<()> {
        let prop = m.prop;
        if self.out.record.slot(prop).is_none() {
            if at.is_some() {
                return Err(NO_PROPERTY);
            }
            self.out
                .record
                .put_slot(PropertySlot::new(prop, SlotPayload::Small(SmallCollection::new())));
        }
        if !self.out.record.slot(prop).is_some_and(|s| s.payload.is_collection()) {
            return Err(NOT_COLLECTION);
        }
        let shown = value.clone();
        let ev = self.element_value(value)?;
        let position = at.map_or(Position::End, Position::Before);
        let supplied = m.element;
        let id = self.with_list(prop, |list| collection::insert(list, position, ev, supplied))?;
        self.out.assigned.push(id);
        self.out.touch(prop, self.original).element_delta += 1;
        self.element_event(prop, id, None, Some(shown));
        Ok(())
    }

    fn set(&mut self, m: &Mutation, value: Value) -> Result<()> {
        let prop = m.prop;
        match m.element {
            None => {
                let flags = match self.out.record.remove_slot(prop) {
                    Some(old) => {
                        let flags = old.flags & !prop_flags::SEPARATE;
                        self.out.evict(self.ctx, self.txn, old.payload)?;
                        flags
                    }
                    None => 0,
                };
                let mut slot = PropertySlot::new(prop, SlotPayload::Inline(value));
                slot.flags = flags;
                self.out.record.put_slot(slot);
                Ok(())
            }
            Some(id) => {
                let shown = value.clone();
                let ev = self.element_value(value)?;
                let old = self.with_list(prop, |list| collection::replace_value(list, id, ev))?;
                let old_shown = inline_of(&old);
                if let ElementValue::Overflow(r) = old {
                    self.out.evict_ref(self.ctx, self.txn, r)?;
                }
                self.element_event(prop, id, old_shown, Some(shown));
                Ok(())
            }
        }
    }

    fn delete(&mut self, m: &Mutation) -> Result<()> {
        let prop = m.prop;
        match m.element {
            None => {
                let old = self.out.record.remove_slot(prop).ok_or(NO_PROPERTY)?;
                self.out.evict(self.ctx, self.txn, old.payload)
            }
            Some(id) => {
                let removed = self.with_list(prop, |list| collection::delete(list, id))?;
                self.out.touch(prop, self.original).element_delta -= 1;
                let old_shown = inline_of(&removed.value);
                if let ElementValue::Overflow(r) = removed.value {
                    self.out.evict_ref(self.ctx, self.txn, r)?;
                }
                self.element_event(prop, id, old_shown, None);
                Ok(())
            }
        }
    }

    fn rename(&mut self, m: &Mutation, to: PropId) -> Result<()> {
        if to == m.prop {
            return Ok(());
        }
        if self.out.record.slot(to).is_some() {
            return Err(StoreError::AlreadyExists("property"));
        }
        let mut slot = self.out.record.remove_slot(m.prop).ok_or(NO_PROPERTY)?;
        slot.prop = to;
        self.out.record.put_slot(slot);
        self.out.touch(to, self.original);
        Ok(())
    }

    fn combine(&mut self, m: &Mutation, op: arith::ArithOp, operand: &Value) -> Result<()> {
        let slot = self.out.record.slot(m.prop).ok_or(NO_PROPERTY)?;
        let unsigned = slot.flags & prop_flags::UNSIGNED != 0;
        match m.element {
            None => {
                let SlotPayload::Inline(current) = &slot.payload else {
                    return Err(StoreError::Invalid("value is not numeric"));
                };
                let next = arith::combine(current, op, operand, unsigned)?;
                if let Some(slot) = self.out.record.slot_mut(m.prop) {
                    slot.payload = SlotPayload::Inline(next);
                }
                Ok(())
            }
            Some(id) => {
                let operand = operand.clone();
                let (old, new) = self.with_list(m.prop, |list| {
                    let element = list.get(id)?.ok_or(StoreError::NotFound("collection element"))?;
                    let ElementValue::Inline(current) = &element.value else {
                        return Err(StoreError::Invalid("value is not numeric"));
                    };
                    let next = arith::combine(current, op, &operand, unsigned)?;
                    let old = collection::replace_value(list, id, ElementValue::Inline(next.clone()))?;
                    Ok((inline_of(&old), next))
                })?;
                self.element_event(m.prop, id, old, Some(new));
                Ok(())
            }
        }
    }

    fn apply(&mut self, m: &Mutation) -> Result<()> {
        self.out.touch(m.prop, self.original);
        match &m.op {
            MutationOp::Set(value) => self.set(m, value.clone())?,
            MutationOp::Add(value) => self.insert(m, None, value.clone())?,
            MutationOp::AddBefore { anchor, value } => self.insert(m, Some(*anchor), value.clone())?,
            MutationOp::Delete => self.delete(m)?,
            MutationOp::Rename(to) => self.rename(m, *to)?,
            MutationOp::Move { before } => {
                let id = m
                    .element
                    .ok_or(StoreError::Invalid("move needs an element id"))?;
                let before = *before;
                self.with_list(m.prop, |list| collection::move_before(list, id, before))?;
            }
            MutationOp::Combine { op, operand } => self.combine(m, *op, operand)?,
        }
        if let Some(flags) = m.flags {
            if flags & !prop_flags::ALL != 0 {
                return Err(StoreError::Invalid("unknown property flags"));
            }
            let target = match m.op {
                MutationOp::Rename(to) => to,
                _ => m.prop,
            };
            let slot = self
                .out
                .record
                .slot_mut(target)
                .ok_or(StoreError::Invalid("flags on a missing property"))?;
            slot.flags = flags;
        }
        Ok(())
    }
}

/// Applies every operation of `batch` to a working copy of `original`.
/// The first failing operation aborts the call with its index.
pub(super) fn classify(
    ctx: &StoreContext,
    txn: &mut PageTxn,
    original: &NodeRecord,
    batch: &MutationBatch,
) -> std::result::Result<Classified, BatchError> {
    let mut classifier = Classifier {
        ctx,
        txn,
        original,
        out: Classified::new(original),
    };
    for (index, m) in batch.ops().iter().enumerate() {
        classifier
            .apply(m)
            .map_err(|err| BatchError::at(index, err))?;
    }
    let out = classifier.out;
    trace!(
        node = out.record.node.0,
        ops = batch.len(),
        props = out.accs.len(),
        elements = out.accs.values().map(|a| a.element_delta).sum::<i64>(),
        "mutation.classify"
    );
    Ok(out)
}
