#![allow(missing_docs)]

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nodestore::primitives::pager::{LogOp, PageStore};
use nodestore::storage::page;
use nodestore::storage::{
    prop_flags, record_flags, ArithOp, ChangeEvent, EventKind, EventLog, LoadMode, MutationBatch,
    NodeRecord, SlotPayload, StoreHooks, StoreOptions, Value, ViewId, ViewMaintenance, ViewOp,
};
use nodestore::types::{NodeId, PropId, Result, StoreError};
use parking_lot::Mutex;
use support::{harness, harness_with, payload, values};

const NAME: PropId = PropId(1);
const BODY: PropId = PropId(2);
const TAGS: PropId = PropId(3);
const COUNT: PropId = PropId(4);

fn inline(store: &nodestore::storage::RecordStore, addr: nodestore::types::RecordAddr, prop: PropId) -> Result<Value> {
    match payload(store, addr, prop)? {
        Some(SlotPayload::Inline(v)) => Ok(v),
        _ => Err(StoreError::NotFound("inline property")),
    }
}

#[test]
fn large_string_on_crowded_page_overflows() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h
        .store
        .create(NodeId(1), &MutationBatch::new().set(NAME, "small"))?;
    let mut filler = MutationBatch::new();
    for i in 0..9 {
        filler = filler.set(PropId(10 + i), "f".repeat(200));
    }
    let neighbour = h.store.create(NodeId(2), &filler)?;
    assert_eq!(neighbour.page, addr.page);
    let free = page::free_space(&h.pager.get_page(addr.page)?)?;
    assert!((1500..2500).contains(&free), "free space {free}");

    let text = "z".repeat(10 * 1024);
    let outcome = h
        .store
        .mutate(addr, &MutationBatch::new().set(BODY, text.clone()))?;
    assert!(!outcome.migrated());
    assert_eq!(outcome.addr, addr);
    assert_eq!(outcome.spilled, vec![BODY]);
    let slot = h.store.read(addr, LoadMode::Lazy)?;
    let body = slot.slot(BODY).expect("body slot");
    assert!(matches!(body.payload, SlotPayload::Overflow(_)));
    assert_ne!(body.flags & prop_flags::SEPARATE, 0);
    assert!(slot.has_flag(record_flags::HAS_OVERFLOW));
    let full = h.store.read(addr, LoadMode::Full)?;
    assert_eq!(full.slot(BODY).map(|s| &s.payload), Some(&SlotPayload::Inline(Value::Str(text))));
    assert_eq!(h.metrics.values_spilled.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn untouched_strings_spill_before_the_record_migrates() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024))?;
    let strings = (0..3).fold(MutationBatch::new(), |batch, i| {
        batch.set(PropId(i), char::from(b'a' + i as u8).to_string().repeat(200))
    });
    let addr = h.store.create(NodeId(1), &strings)?;
    let neighbour = h
        .store
        .create(NodeId(2), &MutationBatch::new().set(PropId(0), "n".repeat(200)))?;
    assert_eq!(neighbour.page, addr.page);

    let floats = (10..20).fold(MutationBatch::new(), |batch, i| {
        batch.set(PropId(i), Value::Float(i as f64 * 0.25))
    });
    let outcome = h.store.mutate(addr, &floats)?;
    assert!(!outcome.migrated());
    assert_eq!(outcome.addr, addr);
    assert_eq!(outcome.spilled.len(), 1);
    assert!(outcome.spilled[0] < PropId(3));
    assert_eq!(h.metrics.records_migrated.load(Ordering::Relaxed), 0);

    let log = h.pager.log();
    assert_eq!(log.last().map(|r| r.props.len()), Some(11));
    let full = h.store.read(addr, LoadMode::Full)?;
    for i in 0..3u32 {
        let text = char::from(b'a' + i as u8).to_string().repeat(200);
        assert_eq!(
            full.slot(PropId(i)).map(|s| &s.payload),
            Some(&SlotPayload::Inline(Value::Str(text)))
        );
    }
    assert_eq!(full.slots().len(), 13);
    Ok(())
}

#[test]
fn failed_log_write_leaves_no_trace() -> Result<()> {
    let h = harness(StoreOptions::new().collection_promote_threshold(4))?;
    let addr = h
        .store
        .create(NodeId(1), &MutationBatch::new().set(NAME, "before").add(TAGS, 1i64))?;
    let before = h.store.read(addr, LoadMode::Lazy)?;
    let log_len = h.pager.log_len();
    let pages = h.pager.live_pages();

    h.pager.fail_next_write(StoreError::NoMemory);
    let mut batch = MutationBatch::new()
        .set(NAME, "after")
        .set(BODY, Value::Bytes(vec![5; 20_000]));
    for v in 0..10i64 {
        batch = batch.add(TAGS, v);
    }
    let err = h.store.mutate(addr, &batch).expect_err("injected failure");
    assert_eq!(err.index, None);
    assert_eq!(err.error, StoreError::NoMemory);

    assert_eq!(h.store.read(addr, LoadMode::Lazy)?, before);
    assert_eq!(h.pager.log_len(), log_len);
    assert_eq!(h.pager.live_pages(), pages);
    assert_eq!(h.metrics.mutations_applied.load(Ordering::Relaxed), 1);

    // The same batch succeeds once the store accepts writes again.
    let outcome = h.store.mutate(addr, &batch)?;
    assert_eq!(outcome.promoted, vec![TAGS]);
    assert_eq!(values(&h.store, addr, TAGS)?.len(), 11);
    Ok(())
}

#[test]
fn first_failing_operation_is_reported() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h.store.create(NodeId(1), &MutationBatch::new().set(NAME, 1i64))?;
    let log_len = h.pager.log_len();
    let err = h
        .store
        .mutate(
            addr,
            &MutationBatch::new()
                .set(NAME, 2i64)
                .delete(PropId(99))
                .set(BODY, 3i64),
        )
        .expect_err("missing property");
    assert_eq!(err.index, Some(1));
    assert_eq!(err.error, StoreError::NotFound("property"));
    assert_eq!(inline(&h.store, addr, NAME)?, Value::Int(1));
    assert!(payload(&h.store, addr, BODY)?.is_none());
    assert_eq!(h.pager.log_len(), log_len);

    let err = h
        .store
        .mutate(addr, &MutationBatch::new().add(NAME, 5i64))
        .expect_err("scalar is not a collection");
    assert_eq!(err.error, StoreError::Invalid("property is not a collection"));
    Ok(())
}

#[test]
fn arithmetic_combines_in_place() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h.store.create(
        NodeId(1),
        &MutationBatch::new()
            .set(COUNT, 10i64)
            .set(NAME, -16i64)
            .with_flags(prop_flags::UNSIGNED)
            .add(TAGS, 5i64),
    )?;
    h.store
        .mutate(addr, &MutationBatch::new().combine(COUNT, None, ArithOp::Add, 5i64))?;
    assert_eq!(inline(&h.store, addr, COUNT)?, Value::Int(15));

    h.store
        .mutate(addr, &MutationBatch::new().combine(NAME, None, ArithOp::Shr, 60i64))?;
    assert_eq!(inline(&h.store, addr, NAME)?, Value::Int(15));

    let tag = h.store.collection_values(addr, TAGS)?[0].0;
    h.store
        .mutate(addr, &MutationBatch::new().combine(TAGS, Some(tag), ArithOp::Mul, 3i64))?;
    assert_eq!(values(&h.store, addr, TAGS)?, vec![Value::Int(15)]);

    let err = h
        .store
        .mutate(
            addr,
            &MutationBatch::new()
                .combine(COUNT, None, ArithOp::Sub, 1i64)
                .combine(COUNT, None, ArithOp::Div, 0i64),
        )
        .expect_err("division by zero");
    assert_eq!(err.index, Some(1));
    assert_eq!(err.error, StoreError::Invalid("division by zero"));
    assert_eq!(inline(&h.store, addr, COUNT)?, Value::Int(15));

    let err = h
        .store
        .mutate(addr, &MutationBatch::new().combine(PropId(50), None, ArithOp::Add, 1i64))
        .expect_err("missing property");
    assert_eq!(err.error, StoreError::NotFound("property"));
    Ok(())
}

#[test]
fn rename_moves_slot_and_rejects_collisions() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h
        .store
        .create(NodeId(1), &MutationBatch::new().set(NAME, "n").set(COUNT, 1i64))?;
    let outcome = h.store.mutate(addr, &MutationBatch::new().rename(NAME, BODY))?;
    assert_eq!(outcome.parts, 2);
    assert!(payload(&h.store, addr, NAME)?.is_none());
    assert_eq!(inline(&h.store, addr, BODY)?, Value::from("n"));

    let err = h
        .store
        .mutate(addr, &MutationBatch::new().rename(BODY, COUNT))
        .expect_err("target exists");
    assert_eq!(err, nodestore::types::BatchError::at(0, StoreError::AlreadyExists("property")));
    let err = h
        .store
        .mutate(addr, &MutationBatch::new().rename(NAME, PropId(9)))
        .expect_err("source missing");
    assert_eq!(err.error, StoreError::NotFound("property"));
    Ok(())
}

#[test]
fn log_records_carry_property_images() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h
        .store
        .create(NodeId(5), &MutationBatch::new().set(NAME, "a").set(COUNT, 1i64))?;
    let log = h.pager.log();
    let created = log.last().expect("create record");
    assert_eq!(created.op, LogOp::Mutate);
    assert_eq!(created.props.len(), 2);
    assert!(created.props.iter().all(|p| p.before.is_empty() && !p.after.is_empty()));

    let outcome = h
        .store
        .mutate(addr, &MutationBatch::new().delete(NAME).set(COUNT, 2i64).set(COUNT, 3i64))?;
    assert_eq!(outcome.parts, 2);
    let log = h.pager.log();
    let last = log.last().expect("mutate record");
    assert_eq!(last.lsn, outcome.lsn);
    let deleted = last.props.iter().find(|p| p.prop == NAME).expect("delete image");
    assert!(!deleted.before.is_empty() && deleted.after.is_empty());
    assert!(last.props.iter().all(|p| p.node == NodeId(5)));
    Ok(())
}

#[test]
fn oversized_record_is_rejected() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024))?;
    let mut batch = MutationBatch::new();
    for i in 0..200 {
        batch = batch.set(PropId(i), Value::Float(i as f64 + 0.5));
    }
    let err = h.store.create(NodeId(1), &batch).expect_err("too big");
    assert_eq!(err.error, StoreError::TooBig);
    assert_eq!(err.index, None);
    assert_eq!(h.pager.log_len(), 0);
    assert_eq!(h.pager.live_pages(), 0);
    Ok(())
}

#[test]
fn records_stay_within_budget() -> Result<()> {
    let options = StoreOptions::new().page_size(1024).record_budget(600);
    let budget = options.effective_record_budget();
    let h = harness(options)?;
    let addr = h.store.create(NodeId(1), &MutationBatch::new())?;
    for i in 0..20u32 {
        let batch = MutationBatch::new().set(PropId(i), "v".repeat(60 + i as usize * 5));
        let outcome = h.store.mutate(addr, &batch)?;
        let record = h.store.read(outcome.addr, LoadMode::Lazy)?;
        assert!(record.encoded_size() <= budget, "record of {} bytes", record.encoded_size());
    }
    Ok(())
}

#[test]
fn force_split_spills_inline_blobs() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h.store.create(
        NodeId(1),
        &MutationBatch::new()
            .set(NAME, "n".repeat(100))
            .set(BODY, "b".repeat(120))
            .set(COUNT, 7i64),
    )?;
    let outcome = h
        .store
        .mutate(addr, &MutationBatch::new().set(COUNT, 8i64).force_split())?;
    let mut spilled = outcome.spilled.clone();
    spilled.sort();
    assert_eq!(spilled, vec![NAME, BODY]);
    assert!(matches!(payload(&h.store, addr, NAME)?, Some(SlotPayload::Overflow(_))));
    assert_eq!(inline(&h.store, addr, COUNT)?, Value::Int(8));
    let full = h.store.read(addr, LoadMode::Full)?;
    assert_eq!(full.slot(BODY).map(|s| &s.payload), Some(&SlotPayload::Inline(Value::from("b".repeat(120)))));
    Ok(())
}

#[test]
fn read_only_stores_refuse_writes() -> Result<()> {
    let h = harness(StoreOptions::new().read_only(true))?;
    let err = h.store.create(NodeId(1), &MutationBatch::new()).expect_err("read-only");
    assert_eq!(err.error, StoreError::ReadOnly);

    let h = harness(StoreOptions::new())?;
    let addr = h.store.create(NodeId(1), &MutationBatch::new().set(NAME, 1i64))?;
    h.pager.set_read_only(true);
    let err = h
        .store
        .mutate(addr, &MutationBatch::new().set(NAME, 2i64))
        .expect_err("read-only");
    assert_eq!(err.error, StoreError::ReadOnly);
    assert_eq!(h.store.soft_delete(addr), Err(StoreError::ReadOnly));
    h.pager.set_read_only(false);
    assert_eq!(inline(&h.store, addr, NAME)?, Value::Int(1));
    Ok(())
}

#[test]
fn fulltext_changes_raise_notifications() -> Result<()> {
    let events = Arc::new(EventLog::new());
    let h = harness_with(StoreOptions::new(), StoreHooks::default().notifier(events.clone()))?;
    let addr = h.store.create(
        NodeId(9),
        &MutationBatch::new()
            .set(NAME, "hello")
            .with_flags(prop_flags::FULLTEXT)
            .set(COUNT, 1i64)
            .add(TAGS, "x")
            .with_flags(prop_flags::FULLTEXT),
    )?;
    let kinds: Vec<(EventKind, Option<PropId>)> = events.take().iter().map(|e| (e.kind, e.prop)).collect();
    assert_eq!(
        kinds,
        vec![(EventKind::IndexableAdded, Some(NAME)), (EventKind::IndexableAdded, Some(TAGS))]
    );

    h.store
        .mutate(addr, &MutationBatch::new().set(NAME, "world").set(COUNT, 2i64))?;
    assert_eq!(
        events.take(),
        vec![ChangeEvent {
            kind: EventKind::IndexedValueChanged,
            node: NodeId(9),
            prop: Some(NAME),
            element: None,
            old: Some(Value::from("hello")),
            new: Some(Value::from("world")),
        }]
    );

    let outcome = h.store.mutate(addr, &MutationBatch::new().add(TAGS, "y"))?;
    let added = events.take();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].kind, EventKind::IndexedValueChanged);
    assert_eq!(added[0].element, Some(outcome.assigned[0]));
    assert_eq!(added[0].new, Some(Value::from("y")));

    h.store.mutate(addr, &MutationBatch::new().delete(NAME))?;
    assert_eq!(events.take()[0].kind, EventKind::IndexableRemoved);

    assert!(h.store.set_hidden(addr, true)?.is_some());
    assert!(h.store.set_hidden(addr, true)?.is_none());
    assert!(h.store.set_hidden(addr, false)?.is_some());
    h.store.soft_delete(addr)?;
    h.store.purge(addr)?;
    let kinds: Vec<EventKind> = events.take().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Hidden, EventKind::Unhidden, EventKind::SoftDeleted, EventKind::Purged]
    );
    Ok(())
}

#[derive(Default)]
struct NameView {
    applied: Mutex<Vec<(ViewId, ViewOp, NodeId)>>,
}

impl ViewMaintenance for NameView {
    fn detect(&self, record: &NodeRecord) -> Vec<ViewId> {
        if record.slot(NAME).is_some() {
            vec![ViewId(1)]
        } else {
            Vec::new()
        }
    }

    fn update_view(&self, view: ViewId, op: ViewOp, record: &NodeRecord) -> Result<()> {
        self.applied.lock().push((view, op, record.node));
        Ok(())
    }
}

#[test]
fn view_membership_follows_mutations() -> Result<()> {
    let views = Arc::new(NameView::default());
    let h = harness_with(StoreOptions::new(), StoreHooks::default().views(views.clone()))?;
    let addr = h.store.create(NodeId(3), &MutationBatch::new().set(NAME, "n"))?;
    h.store.mutate(addr, &MutationBatch::new().set(COUNT, 1i64))?;
    h.store.mutate(addr, &MutationBatch::new().delete(NAME))?;
    h.store.mutate(addr, &MutationBatch::new().set(COUNT, 2i64))?;
    let ops: Vec<ViewOp> = views.applied.lock().iter().map(|(_, op, _)| *op).collect();
    assert_eq!(ops, vec![ViewOp::Insert, ViewOp::Update, ViewOp::Remove]);
    Ok(())
}

#[test]
fn live_views_refresh_and_purge_reclaims_everything() -> Result<()> {
    let h = harness(StoreOptions::new().collection_promote_threshold(4))?;
    let mut batch = MutationBatch::new().set(BODY, Value::Bytes(vec![1; 9000]));
    for i in 0..12 {
        batch = batch.add(TAGS, "t".repeat(150 + i));
    }
    let addr = h.store.create(NodeId(4), &batch)?;
    assert!(matches!(payload(&h.store, addr, TAGS)?, Some(SlotPayload::Big(_))));
    let view = h.store.view(addr)?;
    assert_eq!(view.version(), 0);

    h.store.mutate(addr, &MutationBatch::new().set(NAME, "named"))?;
    assert_eq!(view.version(), 1);
    assert_eq!(view.slot(NAME).map(|s| s.payload), Some(SlotPayload::Inline(Value::from("named"))));

    assert_eq!(
        h.store.purge(addr),
        Err(StoreError::Invalid("record is not soft-deleted"))
    );
    h.store.soft_delete(addr)?;
    let err = h
        .store
        .mutate(addr, &MutationBatch::new().set(NAME, "again"))
        .expect_err("soft-deleted");
    assert_eq!(err.error, StoreError::Invalid("record is soft-deleted"));

    let lsn = h.store.purge(addr)?;
    assert_eq!(h.pager.log().last().map(|r| (r.lsn, r.op)), Some((lsn, LogOp::Purge)));
    assert!(view.is_purged());
    assert_eq!(h.pager.live_pages(), 0);
    assert!(h.store.read(addr, LoadMode::Lazy).is_err());
    Ok(())
}
