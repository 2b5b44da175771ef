#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use nodestore::primitives::pager::{MemPager, PageStore, PageTxn};
use nodestore::storage::collection::{
    big, delete, ids, insert, move_before, BigHandle, BigView, Direction, ElementRead,
    ElementValue, ElementWrite, Position, SmallCollection,
};
use nodestore::storage::{
    record_flags, verify_record, LoadMode, MutationBatch, SlotPayload, StoreOptions, Value,
};
use nodestore::types::{ElementId, NodeId, PropId, Result, StoreError};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use support::{harness, payload, values};

const LIST: PropId = PropId(7);

#[derive(Clone, Debug)]
enum ListOp {
    Append,
    InsertBefore(usize),
    Move(usize, Option<usize>),
    Delete(usize),
}

fn arb_op() -> impl Strategy<Value = ListOp> {
    prop_oneof![
        3 => Just(ListOp::Append),
        2 => any::<usize>().prop_map(ListOp::InsertBefore),
        2 => (any::<usize>(), prop::option::of(any::<usize>())).prop_map(|(a, b)| ListOp::Move(a, b)),
        2 => any::<usize>().prop_map(ListOp::Delete),
    ]
}

/// Applies `op` to both `list` and the reference order.
fn apply<L: ElementWrite + ?Sized>(list: &mut L, model: &mut Vec<ElementId>, op: &ListOp, seq: &mut i64) -> Result<()> {
    *seq += 1;
    let value = ElementValue::Inline(Value::Int(*seq));
    match *op {
        ListOp::Append => {
            let id = insert(list, Position::End, value, None)?;
            model.push(id);
        }
        ListOp::InsertBefore(_) | ListOp::Move(..) | ListOp::Delete(_) if model.is_empty() => {}
        ListOp::InsertBefore(i) => {
            let at = i % model.len();
            let id = insert(list, Position::Before(model[at]), value, None)?;
            model.insert(at, id);
        }
        ListOp::Move(i, target) => {
            let id = model[i % model.len()];
            let target = target.map(|t| model[t % model.len()]);
            move_before(list, id, target)?;
            if target != Some(id) {
                model.retain(|e| *e != id);
                match target {
                    Some(t) => {
                        let pos = model.iter().position(|e| *e == t).unwrap_or(model.len());
                        model.insert(pos, id);
                    }
                    None => model.push(id),
                }
            }
        }
        ListOp::Delete(i) => {
            let id = model.remove(i % model.len());
            delete(list, id)?;
        }
    }
    Ok(())
}

fn traversals<L: ElementRead + ?Sized>(list: &L) -> Result<(Vec<ElementId>, Vec<ElementId>)> {
    let forward = ids(list, Direction::Forward)?;
    let mut backward = ids(list, Direction::Backward)?;
    backward.reverse();
    Ok((forward, backward))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]
    #[test]
    fn small_collection_keeps_order(ops in prop::collection::vec(arb_op(), 1..80)) {
        let mut list = SmallCollection::new();
        let mut model = Vec::new();
        let mut seq = 0;
        for op in &ops {
            apply(&mut list, &mut model, op, &mut seq).expect("apply");
        }
        let (forward, backward) = traversals(&list).expect("traverse");
        prop_assert_eq!(&forward, &model);
        prop_assert_eq!(&backward, &model);
        prop_assert_eq!(list.len(), model.len());
    }

    #[test]
    fn big_collection_keeps_order(ops in prop::collection::vec(arb_op(), 1..300)) {
        let store: Arc<dyn PageStore> = Arc::new(MemPager::new(256, None));
        let mut txn = PageTxn::new(store);
        let mut desc = big::promote(&mut txn, SmallCollection::new(), 4).expect("promote");
        let mut model = Vec::new();
        let mut seq = 0;
        {
            let mut handle = BigHandle::new(&mut txn, &mut desc, 4);
            for op in &ops {
                apply(&mut handle, &mut model, op, &mut seq).expect("apply");
            }
        }
        let view = BigView::new(&txn, &desc);
        let (forward, backward) = traversals(&view).expect("traverse");
        prop_assert_eq!(&forward, &model);
        prop_assert_eq!(&backward, &model);
        prop_assert_eq!(desc.header.count as usize, model.len());
    }
}

#[test]
fn promotion_after_threshold_keeps_insertion_order() -> Result<()> {
    let h = harness(StoreOptions::new().collection_promote_threshold(256))?;
    let addr = h.store.create(NodeId(1), &MutationBatch::new())?;
    for i in 0..300i64 {
        h.store.mutate(addr, &MutationBatch::new().add(LIST, i))?;
        let shape = payload(&h.store, addr, LIST)?;
        match shape {
            Some(SlotPayload::Small(_)) => assert!(i < 256, "still small after insert {}", i + 1),
            Some(SlotPayload::Big(_)) => assert!(i >= 256, "promoted early at insert {}", i + 1),
            other => panic!("unexpected payload {other:?}"),
        }
    }
    let expect: Vec<Value> = (0..300i64).map(Value::Int).collect();
    assert_eq!(values(&h.store, addr, LIST)?, expect);
    let mut reversed = h
        .store
        .collection_values_rev(addr, LIST)?
        .into_iter()
        .map(|(_, v)| v)
        .collect::<Vec<_>>();
    reversed.reverse();
    assert_eq!(reversed, expect);
    assert_eq!(h.metrics.collections_promoted.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert!(verify_record(&h.store, addr)?.success);
    Ok(())
}

#[test]
fn overflow_flag_tracks_only_record_resident_elements() -> Result<()> {
    let h = harness(StoreOptions::new().collection_promote_threshold(3))?;
    let addr = h.store.create(NodeId(1), &MutationBatch::new())?;
    for i in 0..3u8 {
        let text = char::from(b'p' + i).to_string().repeat(500);
        h.store.mutate(addr, &MutationBatch::new().add(LIST, text))?;
    }
    let small = h.store.read(addr, LoadMode::Lazy)?;
    assert!(matches!(payload(&h.store, addr, LIST)?, Some(SlotPayload::Small(_))));
    assert!(small.has_flag(record_flags::COMPOUND));
    assert!(small.has_flag(record_flags::HAS_OVERFLOW));

    let outcome = h
        .store
        .mutate(addr, &MutationBatch::new().add(LIST, "s".repeat(500)))?;
    assert_eq!(outcome.promoted, vec![LIST]);
    let big = h.store.read(addr, LoadMode::Lazy)?;
    assert!(big.has_flag(record_flags::COMPOUND));
    assert!(!big.has_flag(record_flags::HAS_OVERFLOW));
    assert_eq!(values(&h.store, addr, LIST)?.len(), 4);
    Ok(())
}

#[test]
fn delete_middle_then_move_head_to_tail() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let mut batch = MutationBatch::new();
    for v in ["a", "b", "c", "d", "e"] {
        batch = batch.add(LIST, v);
    }
    let outcome = h.store.create_with_outcome(NodeId(2), &batch)?;
    let addr = outcome.addr;
    let ids = outcome.assigned;
    assert_eq!(ids.len(), 5);

    h.store
        .mutate(addr, &MutationBatch::new().delete_element(LIST, ids[2]))?;
    h.store
        .mutate(addr, &MutationBatch::new().move_before(LIST, ids[0], None))?;

    let listed = h.store.collection_values(addr, LIST)?;
    let order: Vec<ElementId> = listed.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![ids[1], ids[3], ids[4], ids[0]]);
    assert_eq!(
        values(&h.store, addr, LIST)?,
        ["b", "d", "e", "a"].map(Value::from).to_vec()
    );
    assert!(verify_record(&h.store, addr)?.success);
    Ok(())
}

#[test]
fn supplied_ids_must_be_unique() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h.store.create(
        NodeId(3),
        &MutationBatch::new().add_with_id(LIST, ElementId(40), 1i64),
    )?;
    let err = h
        .store
        .mutate(
            addr,
            &MutationBatch::new()
                .add(LIST, 2i64)
                .add_with_id(LIST, ElementId(40), 3i64),
        )
        .expect_err("duplicate id");
    assert_eq!(err.index, Some(1));
    assert_eq!(err.error, StoreError::AlreadyExists("collection element"));
    assert_eq!(values(&h.store, addr, LIST)?, vec![Value::Int(1)]);
    // The generator moved past the supplied id.
    let outcome = h.store.mutate(addr, &MutationBatch::new().add(LIST, 4i64))?;
    assert_eq!(outcome.assigned, vec![ElementId(41)]);
    Ok(())
}

#[test]
fn randomized_store_operations_stay_symmetric() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024).collection_promote_threshold(24))?;
    let addr = h.store.create(NodeId(4), &MutationBatch::new())?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    let mut model: Vec<ElementId> = Vec::new();
    for step in 0..400i64 {
        let batch = match rng.gen_range(0..4) {
            _ if model.is_empty() => MutationBatch::new().add(LIST, step),
            0 | 1 => MutationBatch::new().add(LIST, step),
            2 => {
                let id = model[rng.gen_range(0..model.len())];
                let target = model[rng.gen_range(0..model.len())];
                MutationBatch::new().move_before(LIST, id, Some(target))
            }
            _ => MutationBatch::new().delete_element(LIST, model[rng.gen_range(0..model.len())]),
        };
        h.store.mutate(addr, &batch)?;
        model = h
            .store
            .collection_values(addr, LIST)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let mut backward: Vec<ElementId> = h
            .store
            .collection_values_rev(addr, LIST)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        backward.reverse();
        assert_eq!(backward, model, "asymmetric after step {step}");
    }
    let report = verify_record(&h.store, addr)?;
    assert!(report.success, "{:?}", report.findings);
    Ok(())
}
