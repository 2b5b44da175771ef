#![allow(missing_docs)]

mod support;

use std::fs;
use std::sync::Arc;

use nodestore::primitives::pager::{MemPager, PageStore};
use nodestore::storage::{
    MutationBatch, OptionsError, RecordStore, StoreHooks, StoreOptions, Value,
};
use nodestore::types::{NodeId, PropId, StoreError};
use support::harness;

type TestResult = std::result::Result<(), Box<dyn std::error::Error>>;

#[test]
fn options_file_configures_the_store() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.toml");
    fs::write(
        &path,
        r#"
page_size = 1024
record_budget = 700
inline_value_limit = 64
collection_promote_threshold = 8
"#,
    )?;
    let options = StoreOptions::from_toml_file(&path)?;
    assert_eq!(options.page_size, 1024);
    assert_eq!(options.effective_record_budget(), 700);
    assert_eq!(options.force_split_min, StoreOptions::default().force_split_min);

    let h = harness(options)?;
    let addr = h.store.create(
        NodeId(1),
        &MutationBatch::new().set(PropId(1), "x".repeat(100)),
    )?;
    let outcome = h.store.mutate(addr, &MutationBatch::new().set(PropId(2), "y".repeat(50)))?;
    assert!(outcome.spilled.is_empty());
    let lazy = h.store.read(addr, nodestore::storage::LoadMode::Lazy)?;
    assert!(matches!(
        lazy.slot(PropId(1)).map(|s| &s.payload),
        Some(nodestore::storage::SlotPayload::Overflow(_))
    ));
    Ok(())
}

#[test]
fn unknown_fields_and_bad_syntax_fail_to_parse() -> TestResult {
    let dir = tempfile::tempdir()?;
    let typo = dir.path().join("typo.toml");
    fs::write(&typo, "page_sise = 4096\n")?;
    assert!(matches!(
        StoreOptions::from_toml_file(&typo),
        Err(OptionsError::Parse { .. })
    ));

    let broken = dir.path().join("broken.toml");
    fs::write(&broken, "page_size = [\n")?;
    let err = StoreOptions::from_toml_file(&broken).expect_err("broken toml");
    assert!(err.to_string().contains("broken.toml"));
    Ok(())
}

#[test]
fn missing_file_reports_read_error() {
    let err = StoreOptions::from_toml_file("/nonexistent/nodestore/store.toml")
        .expect_err("missing file");
    assert!(matches!(err, OptionsError::Read { .. }));
}

#[test]
fn inconsistent_values_are_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("small.toml");
    fs::write(&path, "page_size = 128\n")?;
    assert!(matches!(
        StoreOptions::from_toml_file(&path),
        Err(OptionsError::Invalid(_))
    ));

    let zero = StoreOptions::new().collection_promote_threshold(0);
    assert!(matches!(zero.validate(), Err(OptionsError::Invalid(_))));
    let pager: Arc<dyn PageStore> = Arc::new(MemPager::new(4096, None));
    assert!(matches!(
        RecordStore::open(zero, pager, StoreHooks::default()),
        Err(StoreError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn page_size_must_match_the_backend() {
    let pager: Arc<dyn PageStore> = Arc::new(MemPager::new(2048, None));
    let err = RecordStore::open(StoreOptions::new(), pager, StoreHooks::default())
        .err()
        .expect("mismatched page size");
    assert_eq!(err, StoreError::Invalid("page store size does not match options"));
}

#[test]
fn page_limit_surfaces_as_no_memory() -> TestResult {
    let h = harness(StoreOptions::new().max_pages(2))?;
    let addr = h.store.create(NodeId(1), &MutationBatch::new().set(PropId(1), 1i64))?;
    let err = h
        .store
        .mutate(addr, &MutationBatch::new().set(PropId(2), Value::Bytes(vec![0; 20_000])))
        .expect_err("page limit");
    assert_eq!(err.error, StoreError::NoMemory);
    assert_eq!(h.pager.live_pages(), 1);
    Ok(())
}

#[test]
fn options_serialize_back_to_toml() -> TestResult {
    let options = StoreOptions::new().page_size(8192).read_only(true);
    let text = toml::to_string(&options)?;
    let parsed = StoreOptions::from_toml_str(&text)?;
    assert_eq!(parsed.page_size, 8192);
    assert!(parsed.read_only);
    Ok(())
}
