use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::primitives::pager::{LockMode, LogOp, PageLock, PageTxn, PropImage};
use crate::storage::hooks::{ChangeEvent, EventKind, ViewId, ViewOp};
use crate::storage::page::{self, RecordsPage};
use crate::storage::record::{encode_stub, prop_flags, record_flags, NodeRecord, PropertySlot, SlotPayload};
use crate::storage::store::{Located, StoreContext};
use crate::storage::value::Value;
use crate::types::{BatchError, Lsn, NodeId, PageId, RecordAddr, Result, StoreError};

use super::classify::{classify, Classified};
use super::plan::{place, Fit, Plan};
use super::{MutationBatch, MutationOutcome};

type BatchResult<T> = std::result::Result<T, BatchError>;

fn slot_bytes(slot: Option<&PropertySlot>) -> Result<Vec<u8>> {
    slot.map_or(Ok(Vec::new()), PropertySlot::to_bytes)
}

/// Stages one before/after property image per touched property, skipping
/// properties the call left unchanged.
fn record_images(txn: &mut PageTxn, node: NodeId, cls: &Classified) -> Result<usize> {
    let mut parts = 0;
    for (prop, acc) in &cls.accs {
        let before = slot_bytes(acc.before.as_ref())?;
        let after = slot_bytes(cls.record.slot(*prop))?;
        if before == after {
            continue;
        }
        txn.record_prop(PropImage {
            node,
            prop: *prop,
            before,
            after,
        });
        parts += 1;
    }
    Ok(parts)
}

/// Copies the unmodified record to a fresh page in its own log record.
fn migrate(ctx: &StoreContext, from: RecordAddr, bytes: &[u8]) -> Result<(RecordAddr, Lsn)> {
    let mut txn = PageTxn::new(Arc::clone(&ctx.store));
    let page = txn.allocate()?;
    let slot = RecordsPage::init(txn.page_mut(page)?, page)?.insert(bytes)?;
    let lsn = txn.commit(LogOp::Migrate)?;
    debug!(from = %from, to = %RecordAddr::new(page, slot), lsn = lsn.0, "mutation.migrate");
    Ok((RecordAddr::new(page, slot), lsn))
}

/// Releases the page of a committed migration whose mutation failed.
fn undo_migration(ctx: &StoreContext, target: RecordAddr) {
    let mut txn = PageTxn::new(Arc::clone(&ctx.store));
    match txn.free(target.page).and_then(|()| txn.commit(LogOp::Rollback)) {
        Ok(lsn) => debug!(page = target.page.0, lsn = lsn.0, "mutation.migrate.rollback"),
        Err(err) => warn!(page = target.page.0, ?err, "mutation.migrate.rollback_failed"),
    }
}

fn write_record(txn: &mut PageTxn, at: RecordAddr, bytes: &[u8]) -> Result<()> {
    RecordsPage::new(txn.page_mut(at.page)?).replace(at.slot, bytes)
}

fn inline(slot: Option<&PropertySlot>) -> Option<Value> {
    match slot.map(|s| &s.payload) {
        Some(SlotPayload::Inline(v)) => Some(v.clone()),
        _ => None,
    }
}

fn is_fulltext(slot: Option<&PropertySlot>) -> bool {
    slot.is_some_and(|s| s.flags & prop_flags::FULLTEXT != 0)
}

fn notify(ctx: &StoreContext, cls: &Classified) {
    let node = cls.record.node;
    for (prop, acc) in &cls.accs {
        let before = acc.before.as_ref();
        let after = cls.record.slot(*prop);
        let kind = match (is_fulltext(before), is_fulltext(after)) {
            (false, true) => Some(EventKind::IndexableAdded),
            (true, false) => Some(EventKind::IndexableRemoved),
            (true, true) if acc.events.is_empty() && before.map(|s| &s.payload) != after.map(|s| &s.payload) => {
                Some(EventKind::IndexedValueChanged)
            }
            _ => None,
        };
        if let Some(kind) = kind {
            ctx.emit(&ChangeEvent {
                kind,
                node,
                prop: Some(*prop),
                element: None,
                old: inline(before),
                new: inline(after),
            });
        }
        if is_fulltext(after) {
            for event in &acc.events {
                ctx.emit(event);
            }
        }
    }
}

/// Diffs view membership before and after the call and forwards the changes.
fn maintain_views(ctx: &StoreContext, before: Option<&NodeRecord>, after: Option<&NodeRecord>) {
    let views = &ctx.hooks.views;
    let old: BTreeSet<ViewId> = before.map(|r| views.detect(r)).unwrap_or_default().into_iter().collect();
    let new: BTreeSet<ViewId> = after.map(|r| views.detect(r)).unwrap_or_default().into_iter().collect();
    let mut ops: Vec<(ViewId, ViewOp, &NodeRecord)> = Vec::new();
    if let Some(after) = after {
        for view in &new {
            let op = if old.contains(view) { ViewOp::Update } else { ViewOp::Insert };
            ops.push((*view, op, after));
        }
    }
    if let Some(before) = before {
        for view in old.difference(&new) {
            ops.push((*view, ViewOp::Remove, before));
        }
    }
    for (view, op, record) in ops {
        if let Err(err) = views.update_view(view, op, record) {
            warn!(view = view.0, ?op, ?err, "mutation.view.update_failed");
        }
    }
}

/// Runs every post-commit side effect of a mutation call.
fn finish(ctx: &StoreContext, addr: RecordAddr, original: Option<&NodeRecord>, cls: &Classified, parts: usize) {
    ctx.release_refs(&cls.evicted);
    ctx.overflow.note_committed(&cls.written);
    ctx.views.refresh(addr, &cls.record);
    maintain_views(ctx, original, Some(&cls.record));
    notify(ctx, cls);
    ctx.metrics.mutation_applied(parts);
}

fn commit(txn: PageTxn, lock: &mut Option<PageLock>, ctx: &StoreContext) -> Result<Lsn> {
    if let Some(lock) = lock {
        lock.upgrade(ctx.options.lock_timeout())?;
    }
    txn.commit(LogOp::Mutate)
}

fn outcome(addr: RecordAddr, lsn: Lsn, migrate_lsn: Option<Lsn>, plan: Plan, cls: Classified, parts: usize) -> MutationOutcome {
    MutationOutcome {
        addr,
        lsn,
        migrate_lsn,
        spilled: plan.spilled,
        promoted: plan.promoted,
        assigned: cls.assigned,
        parts,
    }
}

pub(crate) fn run_mutate(ctx: &StoreContext, addr: RecordAddr, batch: &MutationBatch) -> BatchResult<MutationOutcome> {
    ctx.check_writable()?;
    let Located {
        lock,
        addr: cur,
        record: original,
        bytes,
        free,
        ..
    } = ctx.locate(addr, LockMode::Upgrade)?;
    if original.has_flag(record_flags::SOFT_DELETED) {
        return Err(StoreError::Invalid("record is soft-deleted").into());
    }
    let mut txn = PageTxn::new(Arc::clone(&ctx.store));
    let mut cls = classify(ctx, &mut txn, &original, batch)?;
    let room = free + bytes.len();
    let plan = place(ctx, &mut txn, &original, &mut cls, room, batch.is_force_split())?;
    let parts = record_images(&mut txn, original.node, &cls)?;

    // Upgrade before the migration commit so nothing after it waits on readers.
    let mut lock = lock;
    lock.upgrade(ctx.options.lock_timeout())?;
    let (target, migrate_lsn) = match plan.fit {
        Fit::InPlace => {
            write_record(&mut txn, cur, &plan.encoded)?;
            (cur, None)
        }
        Fit::Migrate => {
            let (to, lsn) = migrate(ctx, cur, &bytes)?;
            (to, Some(lsn))
        }
    };
    let result = (|| {
        if migrate_lsn.is_some() {
            write_record(&mut txn, target, &plan.encoded)?;
            write_record(&mut txn, cur, &encode_stub(original.node, target)?)?;
        }
        txn.commit(LogOp::Mutate)
    })();
    let lsn = match result {
        Ok(lsn) => lsn,
        Err(err) => {
            if migrate_lsn.is_some() {
                undo_migration(ctx, target);
            }
            return Err(BatchError::whole(err));
        }
    };
    drop(lock);

    if migrate_lsn.is_some() {
        ctx.metrics.record_migrated();
        *ctx.insert_hint.lock() = Some(target.page);
    }
    finish(ctx, target, Some(&original), &cls, parts);
    debug!(
        node = original.node.0,
        addr = %target,
        lsn = lsn.0,
        parts,
        spilled = plan.spilled.len(),
        promoted = plan.promoted.len(),
        migrated = migrate_lsn.is_some(),
        "mutation.apply"
    );
    Ok(outcome(target, lsn, migrate_lsn, plan, cls, parts))
}

/// Picks the insert-hint page when it can hold `len` bytes.
fn hinted_page(ctx: &StoreContext, txn: &PageTxn, len: usize) -> Result<Option<(PageId, PageLock)>> {
    let Some(page) = *ctx.insert_hint.lock() else {
        return Ok(None);
    };
    if !ctx.store.is_allocated(page) {
        return Ok(None);
    }
    let lock = ctx.store.lock(page, LockMode::Upgrade, ctx.options.lock_timeout())?;
    let data = txn.page(page)?;
    if page::check(&data, page).is_err() || page::insert_capacity(&data)? < len {
        return Ok(None);
    }
    Ok(Some((page, lock)))
}

pub(crate) fn run_create(ctx: &StoreContext, node: NodeId, batch: &MutationBatch) -> BatchResult<MutationOutcome> {
    ctx.check_writable()?;
    let original = NodeRecord::new(node);
    let mut txn = PageTxn::new(Arc::clone(&ctx.store));
    let mut cls = classify(ctx, &mut txn, &original, batch)?;
    let budget = ctx.options.effective_record_budget();
    let plan = place(ctx, &mut txn, &original, &mut cls, budget, batch.is_force_split())?;
    let parts = record_images(&mut txn, node, &cls)?;

    let (page, mut lock) = match hinted_page(ctx, &txn, plan.encoded.len())? {
        Some((page, lock)) => (page, Some(lock)),
        None => {
            let page = txn.allocate()?;
            RecordsPage::init(txn.page_mut(page)?, page)?;
            (page, None)
        }
    };
    let slot = RecordsPage::new(txn.page_mut(page)?).insert(&plan.encoded)?;
    let addr = RecordAddr::new(page, slot);
    let lsn = commit(txn, &mut lock, ctx).map_err(BatchError::whole)?;
    drop(lock);

    *ctx.insert_hint.lock() = Some(page);
    ctx.metrics.record_created();
    finish(ctx, addr, None, &cls, parts);
    debug!(node = node.0, addr = %addr, lsn = lsn.0, parts, "mutation.create");
    Ok(outcome(addr, lsn, None, plan, cls, parts))
}

/// Sets and clears record flags in place. Returns `None` when the flags
/// already had the requested values.
pub(crate) fn commit_flags(
    ctx: &StoreContext,
    addr: RecordAddr,
    set: u8,
    clear: u8,
    kind: EventKind,
) -> Result<Option<Lsn>> {
    ctx.check_writable()?;
    let Located {
        mut lock,
        addr: cur,
        record: original,
        ..
    } = ctx.locate(addr, LockMode::Upgrade)?;
    let mut record = original.clone();
    record.flags = (record.flags | set) & !clear;
    if record.flags == original.flags {
        return Ok(None);
    }
    let mut txn = PageTxn::new(Arc::clone(&ctx.store));
    write_record(&mut txn, cur, &record.encode()?)?;
    lock.upgrade(ctx.options.lock_timeout())?;
    let lsn = txn.commit(LogOp::Mutate)?;
    drop(lock);

    ctx.views.refresh(cur, &record);
    let visible = |r: &NodeRecord| !r.has_flag(record_flags::HIDDEN | record_flags::SOFT_DELETED);
    let before = visible(&original).then_some(&original);
    let after = visible(&record).then_some(&record);
    maintain_views(ctx, before, after);
    ctx.emit(&ChangeEvent::record(kind, record.node));
    trace!(node = record.node.0, flags = record.flags, lsn = lsn.0, "mutation.flags");
    Ok(Some(lsn))
}
