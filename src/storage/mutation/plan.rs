use tracing::debug;

use crate::primitives::pager::PageTxn;
use crate::storage::codec;
use crate::storage::collection::big::{self, DESCRIPTOR_FIXED_LEN};
use crate::storage::record::{prop_flags, NodeRecord, SlotPayload};
use crate::storage::store::StoreContext;
use crate::storage::value::Value;
use crate::types::{PropId, Result, StoreError};

use super::classify::Classified;

/// Where the encoded record goes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) enum Fit {
    /// Replaces the current image on its page.
    InPlace,
    /// Moves to a fresh page behind a forwarding stub.
    Migrate,
}

pub(super) struct Plan {
    pub fit: Fit,
    pub encoded: Vec<u8>,
    pub spilled: Vec<PropId>,
    pub promoted: Vec<PropId>,
}

/// Which slots a shrinking pass may act on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Sweep {
    /// Touched slots and oversized inline values.
    Touched,
    /// Every inline value and small collection.
    All,
    /// Every slot saving at least `force_split_min` bytes.
    Forced,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Action {
    Spill,
    Promote,
}

struct Candidate {
    prop: PropId,
    action: Action,
    savings: usize,
}

fn spill_savings(value: &Value) -> usize {
    let len = value.blob().map_or(0, |b| b.len() as u64);
    codec::encoded_size(value).saturating_sub(codec::overflow_ref_size(len))
}

fn promote_savings(ctx: &StoreContext, payload: &SlotPayload) -> usize {
    let SlotPayload::Small(list) = payload else {
        return 0;
    };
    let bytes = list.encoded_size();
    let leaf_room = (ctx.options.page_size as usize).saturating_sub(big::LEAF_HDR_END).max(1);
    let leaves = (2 * bytes / leaf_room + 1).min(ctx.options.big_fanout_max as usize);
    bytes.saturating_sub(DESCRIPTOR_FIXED_LEN + 8 * leaves)
}

fn is_inline_blob(payload: &SlotPayload) -> Option<&Value> {
    match payload {
        SlotPayload::Inline(v) if v.blob().is_some() => Some(v),
        _ => None,
    }
}

struct Placer<'a> {
    ctx: &'a StoreContext,
    txn: &'a mut PageTxn,
    original: &'a NodeRecord,
    cls: &'a mut Classified,
    spilled: Vec<PropId>,
    promoted: Vec<PropId>,
}

impl Placer<'_> {
    fn size(&self) -> usize {
        self.cls.record.encoded_size()
    }

    fn spill(&mut self, prop: PropId) -> Result<()> {
        let value = match self.cls.record.slot(prop).map(|s| &s.payload) {
            Some(SlotPayload::Inline(v)) => v.clone(),
            _ => return Ok(()),
        };
        let r = self.cls.spill(self.ctx, self.txn, &value)?;
        self.cls.touch(prop, self.original);
        if let Some(slot) = self.cls.record.slot_mut(prop) {
            slot.payload = SlotPayload::Overflow(r);
            slot.flags |= prop_flags::SEPARATE;
        }
        self.ctx.metrics.value_spilled();
        self.spilled.push(prop);
        Ok(())
    }

    fn promote(&mut self, prop: PropId) -> Result<()> {
        let fanout = self.ctx.options.big_fanout_max as usize;
        if !matches!(self.cls.record.slot(prop).map(|s| &s.payload), Some(SlotPayload::Small(_))) {
            return Ok(());
        }
        self.cls.touch(prop, self.original);
        let Some(slot) = self.cls.record.slot_mut(prop) else {
            return Ok(());
        };
        let SlotPayload::Small(list) = &mut slot.payload else {
            return Ok(());
        };
        let list = std::mem::take(list);
        let elements = list.len();
        slot.payload = SlotPayload::Big(big::promote(self.txn, list, fanout)?);
        self.ctx.metrics.collection_promoted();
        self.promoted.push(prop);
        debug!(node = self.cls.record.node.0, prop = prop.0, elements, "mutation.promote");
        Ok(())
    }

    fn act(&mut self, c: &Candidate) -> Result<()> {
        match c.action {
            Action::Spill => self.spill(c.prop),
            Action::Promote => self.promote(c.prop),
        }
    }

    /// Spills and promotions every touched slot needs regardless of fit.
    fn mandatory(&mut self) -> Result<()> {
        let opts = &self.ctx.options;
        let mut todo = Vec::new();
        for prop in self.cls.accs.keys() {
            let Some(slot) = self.cls.record.slot(*prop) else {
                continue;
            };
            match &slot.payload {
                SlotPayload::Inline(v) if v.blob().is_some() => {
                    if codec::encoded_size(v) > opts.inline_value_limit as usize
                        || !codec::fits_inline(v)
                    {
                        todo.push((*prop, Action::Spill));
                    }
                }
                SlotPayload::Small(list) => {
                    if list.len() > opts.collection_promote_threshold as usize
                        || 2 + list.encoded_size() > u16::MAX as usize
                    {
                        todo.push((*prop, Action::Promote));
                    }
                }
                _ => {}
            }
        }
        for (prop, action) in todo {
            match action {
                Action::Spill => self.spill(prop)?,
                Action::Promote => self.promote(prop)?,
            }
        }
        Ok(())
    }

    fn candidates(&self, sweep: Sweep) -> Vec<Candidate> {
        let opts = &self.ctx.options;
        let force = sweep == Sweep::Forced;
        let mut out = Vec::new();
        for slot in self.cls.record.slots() {
            let in_sweep = sweep != Sweep::Touched || self.cls.accs.contains_key(&slot.prop);
            let candidate = if let Some(v) = is_inline_blob(&slot.payload) {
                let eligible =
                    in_sweep || codec::encoded_size(v) > opts.inline_value_limit as usize;
                eligible.then(|| Candidate {
                    prop: slot.prop,
                    action: Action::Spill,
                    savings: spill_savings(v),
                })
            } else if matches!(slot.payload, SlotPayload::Small(_)) && in_sweep {
                Some(Candidate {
                    prop: slot.prop,
                    action: Action::Promote,
                    savings: promote_savings(self.ctx, &slot.payload),
                })
            } else {
                None
            };
            match candidate {
                Some(c) if force && c.savings < opts.force_split_min as usize => {}
                Some(c) if c.savings > 0 => out.push(c),
                _ => {}
            }
        }
        out.sort_by(|a, b| b.savings.cmp(&a.savings).then(a.prop.cmp(&b.prop)));
        out
    }

    fn shrink_to(&mut self, target: usize, sweep: Sweep) -> Result<()> {
        for c in self.candidates(sweep) {
            if self.size() <= target {
                break;
            }
            self.act(&c)?;
        }
        Ok(())
    }
}

/// Decides spills, promotions, and placement. `in_place_limit` is the
/// largest image the record's current page can hold for it.
pub(super) fn place(
    ctx: &StoreContext,
    txn: &mut PageTxn,
    original: &NodeRecord,
    cls: &mut Classified,
    in_place_limit: usize,
    force_split: bool,
) -> Result<Plan> {
    let budget = ctx.options.effective_record_budget();
    let in_place_limit = in_place_limit.min(budget);
    let mut placer = Placer {
        ctx,
        txn,
        original,
        cls,
        spilled: Vec::new(),
        promoted: Vec::new(),
    };
    placer.mandatory()?;
    if force_split {
        placer.shrink_to(0, Sweep::Forced)?;
    } else if placer.size() > in_place_limit {
        placer.shrink_to(in_place_limit, Sweep::Touched)?;
        // Migration only once nothing else can be moved off the record.
        if placer.size() > in_place_limit {
            placer.shrink_to(in_place_limit, Sweep::All)?;
        }
    }
    let size = placer.size();
    let fit = if size <= in_place_limit {
        Fit::InPlace
    } else if size <= budget {
        Fit::Migrate
    } else {
        return Err(StoreError::TooBig);
    };
    let (spilled, promoted) = (placer.spilled, placer.promoted);
    cls.record.refresh_flags();
    let encoded = cls.record.encode()?;
    Ok(Plan {
        fit,
        encoded,
        spilled,
        promoted,
    })
}
