#![allow(missing_docs)]

mod support;

use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;

use nodestore::storage::{Decoded, LoadMode, MutationBatch, SlotPayload, StoreOptions, Value};
use nodestore::types::{NodeId, PropId, Result, StoreError};
use support::{harness, init_tracing};

const BLOB: PropId = PropId(1);

fn blob(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn reader_finishes_after_concurrent_delete() -> Result<()> {
    init_tracing();
    let h = harness(StoreOptions::new())?;
    let bytes = blob(40_000);
    let addr = h
        .store
        .create(NodeId(1), &MutationBatch::new().set(BLOB, bytes.clone()))?;
    let pages_with_blob = h.pager.live_pages();

    let mut stream = h.store.open_overflow(addr, BLOB)?;
    let mut first = vec![0u8; bytes.len() / 2];
    let mut filled = 0;
    while filled < first.len() {
        filled += stream.read(&mut first[filled..])?;
    }

    let (deleted_tx, deleted_rx) = mpsc::channel();
    let rest = thread::scope(|scope| -> Result<Vec<u8>> {
        let reader = scope.spawn(move || -> Result<Vec<u8>> {
            deleted_rx
                .recv()
                .map_err(|_| StoreError::Invalid("writer vanished"))?;
            let rest = stream.read_to_end()?;
            stream.close()?;
            Ok(rest)
        });
        let outcome = h.store.mutate(addr, &MutationBatch::new().delete(BLOB))?;
        assert!(outcome.lsn.0 > 0);
        // Reader still open: nothing may be freed yet.
        assert_eq!(h.pager.live_pages(), pages_with_blob);
        assert_eq!(h.metrics.overflow_reclaimed_deferred.load(Ordering::Relaxed), 1);
        deleted_tx
            .send(())
            .map_err(|_| StoreError::Invalid("reader vanished"))?;
        reader
            .join()
            .map_err(|_| StoreError::Invalid("reader panicked"))?
    })?;
    assert_eq!([first, rest].concat(), bytes);
    assert!(h.pager.live_pages() < pages_with_blob);
    assert_eq!(h.store.overflow().metrics().live_chunks(), 0);
    Ok(())
}

#[test]
fn storage_returns_only_after_last_of_many_readers() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let bytes = blob(12_000);
    let addr = h
        .store
        .create(NodeId(2), &MutationBatch::new().set(BLOB, bytes.clone()))?;
    let full = h.pager.live_pages();
    let chunks = h.store.overflow().chunks_for(bytes.len() as u64);

    let streams = (0..4)
        .map(|_| h.store.open_overflow(addr, BLOB))
        .collect::<Result<Vec<_>>>()?;
    h.store.mutate(addr, &MutationBatch::new().delete(BLOB))?;
    assert!(matches!(
        h.store.open_overflow(addr, BLOB),
        Err(StoreError::NotFound(_))
    ));

    let mut remaining = streams.len();
    for mut stream in streams {
        assert_eq!(stream.read_to_end()?, bytes);
        remaining -= 1;
        stream.close()?;
        if remaining > 0 {
            assert_eq!(h.pager.live_pages(), full);
        }
    }
    assert_eq!(h.pager.live_pages(), full - chunks);
    assert_eq!(h.store.overflow().metrics().deferred_reclaims, 1);
    Ok(())
}

#[test]
fn dropped_stream_counts_as_closed() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let addr = h
        .store
        .create(NodeId(3), &MutationBatch::new().set(BLOB, Value::Str("q".repeat(5000))))?;
    let full = h.pager.live_pages();
    let stream = h.store.open_overflow(addr, BLOB)?;
    h.store
        .mutate(addr, &MutationBatch::new().set(BLOB, Value::Int(1)))?;
    assert_eq!(h.pager.live_pages(), full);
    drop(stream);
    assert!(h.pager.live_pages() < full);
    Ok(())
}

#[test]
fn reset_and_positional_reads_are_repeatable() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let bytes = blob(9_000);
    let addr = h
        .store
        .create(NodeId(4), &MutationBatch::new().set(BLOB, bytes.clone()))?;
    let mut stream = h.store.open_overflow(addr, BLOB)?;
    assert_eq!(stream.len(), bytes.len() as u64);
    let first = stream.read_to_end()?;
    stream.reset();
    let second = stream.read_to_end()?;
    assert_eq!(first, second);
    let mut window = [0u8; 64];
    let n = stream.read_at(4_000, &mut window)?;
    assert_eq!(&window[..n], &bytes[4_000..4_000 + n]);
    stream.close()?;
    Ok(())
}

#[test]
fn full_reads_never_see_a_released_chain() -> Result<()> {
    let h = harness(StoreOptions::new())?;
    let old = blob(6_000);
    let new: Vec<u8> = old.iter().map(|b| b ^ 0xff).collect();
    let addr = h
        .store
        .create(NodeId(5), &MutationBatch::new().set(BLOB, old.clone()))?;

    thread::scope(|scope| -> Result<()> {
        let writer = scope.spawn(|| -> Result<()> {
            for round in 0..200 {
                let bytes = if round % 2 == 0 { new.clone() } else { old.clone() };
                h.store.mutate(addr, &MutationBatch::new().set(BLOB, bytes))?;
            }
            Ok(())
        });
        for _ in 0..200 {
            match h.store.property(addr, BLOB, LoadMode::Full)? {
                Some(Decoded::Value(Value::Bytes(bytes))) => assert!(bytes == old || bytes == new),
                other => panic!("unexpected property {other:?}"),
            }
            let record = h.store.read(addr, LoadMode::Full)?;
            match record.slot(BLOB).map(|s| &s.payload) {
                Some(SlotPayload::Inline(Value::Bytes(bytes))) => assert!(*bytes == old || *bytes == new),
                other => panic!("unexpected slot {other:?}"),
            }
        }
        writer
            .join()
            .map_err(|_| StoreError::Invalid("writer panicked"))?
    })?;
    let last = h.store.read(addr, LoadMode::Full)?;
    assert_eq!(
        last.slot(BLOB).map(|s| &s.payload),
        Some(&SlotPayload::Inline(Value::Bytes(old)))
    );
    Ok(())
}
