#![allow(missing_docs)]

mod support;

use std::collections::BTreeMap;

use nodestore::storage::codec::{decode_inline, encode, encoded_size, fits_inline, tag_word};
use nodestore::storage::record::RecordImage;
use nodestore::storage::{
    LoadMode, MutationBatch, NodeRecord, PropertySlot, SlotPayload, StoreOptions, Value,
};
use nodestore::types::{NodeId, PropId, Result};
use proptest::prelude::*;
use support::{harness, payload};

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<u64>().prop_map(Value::UInt),
        any::<f64>().prop_map(|f| Value::Float(if f.is_nan() { 0.0 } else { f })),
        "[a-zA-Z0-9 ]{0,300}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..600).prop_map(Value::Bytes),
        any::<i64>().prop_map(Value::Date),
        any::<i64>().prop_map(Value::DateTime),
    ]
}

fn arb_record() -> impl Strategy<Value = NodeRecord> {
    (any::<u64>(), prop::collection::btree_map(0u32..64, arb_value(), 0..12)).prop_map(|(node, props)| {
        let mut record = NodeRecord::new(NodeId(node));
        for (prop, value) in props {
            record.put_slot(PropertySlot::new(PropId(prop), SlotPayload::Inline(value)));
        }
        record
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]
    #[test]
    fn inline_values_roundtrip(value in arb_value(), offset in 0usize..8) {
        prop_assume!(fits_inline(&value));
        let mut buf = vec![0u8; offset + encoded_size(&value)];
        let written = encode(&value, &mut buf, offset).expect("encode");
        prop_assert_eq!(written, encoded_size(&value));
        let mut cursor = offset;
        let decoded = decode_inline(tag_word(&value), &buf, &mut cursor).expect("decode");
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(cursor, buf.len());
    }

    #[test]
    fn record_images_roundtrip(record in arb_record()) {
        let bytes = record.encode().expect("encode record");
        prop_assert_eq!(bytes.len(), record.encoded_size());
        let image = RecordImage::decode(&bytes).expect("decode record");
        prop_assert_eq!(image, RecordImage::Record(record));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn overflowed_values_roundtrip(len in 300usize..9000, text in any::<bool>()) {
        let h = harness(StoreOptions::new()).expect("store");
        let value = if text {
            Value::Str("ab".repeat(len / 2))
        } else {
            Value::Bytes((0..len).map(|i| (i % 253) as u8).collect())
        };
        let addr = h
            .store
            .create(NodeId(1), &MutationBatch::new().set(PropId(1), value.clone()))
            .expect("create");
        let lazy = payload(&h.store, addr, PropId(1)).expect("lazy read");
        prop_assert!(matches!(lazy, Some(SlotPayload::Overflow(_))));
        let full = h.store.read(addr, LoadMode::Full).expect("full read");
        prop_assert_eq!(&full.slot(PropId(1)).expect("slot").payload, &SlotPayload::Inline(value));
    }
}

#[test]
fn stored_record_matches_written_values() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let props: BTreeMap<u32, Value> = [
        (3, Value::Int(-7)),
        (1, Value::Str("alpha".into())),
        (9, Value::Float(1.25)),
        (4, Value::UInt(300)),
        (2, Value::Bytes(vec![1, 2, 3])),
    ]
    .into_iter()
    .collect();
    let mut batch = MutationBatch::new();
    for (prop, value) in &props {
        batch = batch.set(PropId(*prop), value.clone());
    }
    let addr = h.store.create(NodeId(77), &batch)?;
    let record = h.store.read(addr, LoadMode::Full)?;
    assert_eq!(record.node, NodeId(77));
    let stored: Vec<(u32, Value)> = record
        .slots()
        .iter()
        .map(|s| match &s.payload {
            SlotPayload::Inline(v) => (s.prop.0, v.clone()),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(stored, props.into_iter().collect::<Vec<_>>());
    Ok(())
}
