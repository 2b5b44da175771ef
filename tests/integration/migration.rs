#![allow(missing_docs)]

mod support;

use std::sync::atomic::Ordering;
use std::time::Duration;

use nodestore::primitives::pager::{LockMode, LogOp, PageStore};
use nodestore::storage::verify::VerifySeverity;
use nodestore::storage::{verify_record, LoadMode, MutationBatch, StoreOptions, Value};
use nodestore::types::{NodeId, PropId, RecordAddr, Result, StoreError};
use support::{harness, Harness};

fn floats(from: u32, count: u32) -> MutationBatch {
    (from..from + count).fold(MutationBatch::new(), |batch, i| {
        batch.set(PropId(i), Value::Float(i as f64 + 1.5))
    })
}

fn slot_bytes(h: &Harness, addr: RecordAddr, props: std::ops::Range<u32>) -> Result<Vec<Vec<u8>>> {
    let record = h.store.read(addr, LoadMode::Lazy)?;
    props
        .map(|p| {
            record
                .slot(PropId(p))
                .ok_or(StoreError::NotFound("property"))?
                .to_bytes()
        })
        .collect()
}

/// A record with ten floats sharing its page with a 640-byte neighbour.
fn crowded(h: &Harness) -> Result<(RecordAddr, RecordAddr)> {
    let a = h.store.create(NodeId(1), &floats(0, 10))?;
    let b = h.store.create(
        NodeId(2),
        &MutationBatch::new()
            .set(PropId(0), "b".repeat(200))
            .set(PropId(1), "c".repeat(200))
            .set(PropId(2), "d".repeat(200)),
    )?;
    assert_eq!(a.page, b.page);
    Ok((a, b))
}

#[test]
fn growing_record_moves_behind_a_stub() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024))?;
    let (a, b) = crowded(&h)?;
    let untouched = slot_bytes(&h, a, 0..10)?;
    let neighbour = h.store.read(b, LoadMode::Lazy)?;

    let outcome = h.store.mutate(a, &floats(10, 40))?;
    assert!(outcome.migrated());
    assert_ne!(outcome.addr.page, a.page);
    assert_eq!(h.store.resolve(a)?, outcome.addr);
    assert_eq!(slot_bytes(&h, a, 0..10)?, untouched);
    assert_eq!(h.store.read(a, LoadMode::Lazy)?.slots().len(), 50);
    assert_eq!(h.store.read(b, LoadMode::Lazy)?, neighbour);
    assert_eq!(h.metrics.records_migrated.load(Ordering::Relaxed), 1);

    let log = h.pager.log();
    let tail: Vec<LogOp> = log[log.len() - 2..].iter().map(|r| r.op).collect();
    assert_eq!(tail, vec![LogOp::Migrate, LogOp::Mutate]);
    assert_eq!(Some(log[log.len() - 2].lsn), outcome.migrate_lsn);
    assert!(log[log.len() - 2].props.is_empty());
    assert_eq!(log[log.len() - 1].props.len(), 40);

    let report = verify_record(&h.store, a)?;
    assert!(report.success);
    assert_eq!(report.counts.forward_hops, 1);
    assert!(report.findings.is_empty());
    Ok(())
}

#[test]
fn failed_migration_changes_nothing() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024))?;
    let (a, _) = crowded(&h)?;
    let before = h.store.read(a, LoadMode::Lazy)?;
    let log_len = h.pager.log_len();
    let pages = h.pager.live_pages();

    h.pager.fail_next_write(StoreError::NoMemory);
    let err = h.store.mutate(a, &floats(10, 40)).expect_err("injected failure");
    assert_eq!(err.error, StoreError::NoMemory);
    assert_eq!(h.pager.log_len(), log_len);
    assert_eq!(h.pager.live_pages(), pages);
    assert_eq!(h.store.resolve(a)?, a);
    assert_eq!(h.store.read(a, LoadMode::Lazy)?, before);
    assert_eq!(h.metrics.records_migrated.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn failed_mutation_after_migration_releases_the_copy() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024))?;
    let (a, b) = crowded(&h)?;
    let before = h.store.read(a, LoadMode::Lazy)?;
    let neighbour = h.store.read(b, LoadMode::Lazy)?;
    let log_len = h.pager.log_len();
    let pages = h.pager.live_pages();

    h.pager.fail_write_after(1, StoreError::NoMemory);
    let err = h.store.mutate(a, &floats(10, 40)).expect_err("injected failure");
    assert_eq!(err.error, StoreError::NoMemory);

    let log = h.pager.log();
    assert_eq!(log.len(), log_len + 2);
    let (copy, undo) = (&log[log_len], &log[log_len + 1]);
    assert_eq!(copy.op, LogOp::Migrate);
    assert_eq!(undo.op, LogOp::Rollback);
    assert_eq!(undo.freed, copy.pages);
    assert!(undo.pages.is_empty());
    assert!(!h.pager.is_allocated(copy.pages[0]));

    assert_eq!(h.pager.live_pages(), pages);
    assert_eq!(h.store.resolve(a)?, a);
    assert_eq!(h.store.read(a, LoadMode::Lazy)?, before);
    assert_eq!(h.store.read(b, LoadMode::Lazy)?, neighbour);
    assert_eq!(h.metrics.records_migrated.load(Ordering::Relaxed), 0);
    Ok(())
}

#[test]
fn busy_page_times_out_before_anything_is_logged() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024).lock_timeout_ms(20))?;
    let (a, _) = crowded(&h)?;
    let before = h.store.read(a, LoadMode::Lazy)?;
    let log_len = h.pager.log_len();
    let pages = h.pager.live_pages();

    let reader = h.pager.lock(a.page, LockMode::Shared, Duration::from_millis(20))?;
    let err = h.store.mutate(a, &floats(10, 40)).expect_err("reader holds the page");
    assert_eq!(err.error, StoreError::LockTimeout);
    assert_eq!(h.pager.log_len(), log_len);
    assert_eq!(h.pager.live_pages(), pages);
    drop(reader);

    assert_eq!(h.store.read(a, LoadMode::Lazy)?, before);
    let outcome = h.store.mutate(a, &floats(10, 40))?;
    assert!(outcome.migrated());
    Ok(())
}

#[test]
fn second_migration_lengthens_the_chain() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024))?;
    let (a, _) = crowded(&h)?;
    let first = h.store.mutate(a, &floats(10, 40))?;
    let c = h
        .store
        .create(NodeId(3), &MutationBatch::new().set(PropId(0), "e".repeat(150)))?;
    assert_eq!(c.page, first.addr.page);

    let second = h.store.mutate(a, &floats(50, 10))?;
    assert!(second.migrated());
    assert_ne!(second.addr.page, first.addr.page);
    assert_eq!(h.store.resolve(a)?, second.addr);
    assert_eq!(h.store.resolve(first.addr)?, second.addr);
    assert_eq!(h.store.read(a, LoadMode::Lazy)?.slots().len(), 60);

    let report = verify_record(&h.store, a)?;
    assert!(report.success);
    assert_eq!(report.counts.forward_hops, 2);
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].severity, VerifySeverity::Warning);
    Ok(())
}

#[test]
fn purge_removes_forwarding_stubs() -> Result<()> {
    let h = harness(StoreOptions::new().page_size(1024))?;
    let (a, b) = crowded(&h)?;
    let moved = h.store.mutate(a, &floats(10, 40))?;
    let pages = h.pager.live_pages();

    h.store.soft_delete(a)?;
    h.store.purge(a)?;
    assert_eq!(h.pager.live_pages(), pages - 1);
    assert!(h.store.resolve(a).is_err());
    assert!(h.store.read(moved.addr, LoadMode::Lazy).is_err());
    // The neighbour still lives on the original page.
    assert_eq!(h.store.read(b, LoadMode::Lazy)?.slots().len(), 3);
    Ok(())
}
