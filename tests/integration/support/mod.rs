#![allow(dead_code)]

use std::sync::Arc;

use nodestore::primitives::pager::{MemPager, PageStore};
use nodestore::storage::{
    CounterMetrics, LoadMode, RecordStore, SlotPayload, StoreHooks, StoreOptions, Value,
};
use nodestore::types::{PropId, RecordAddr, Result};

pub struct Harness {
    pub pager: Arc<MemPager>,
    pub store: RecordStore,
    pub metrics: Arc<CounterMetrics>,
}

pub fn harness_with(options: StoreOptions, hooks: StoreHooks) -> Result<Harness> {
    let pager = Arc::new(MemPager::new(options.page_size as usize, options.max_pages));
    let metrics = Arc::new(CounterMetrics::default());
    let page_store: Arc<dyn PageStore> = pager.clone();
    let store = RecordStore::open(options.metrics(metrics.clone()), page_store, hooks)?;
    Ok(Harness {
        pager,
        store,
        metrics,
    })
}

pub fn harness(options: StoreOptions) -> Result<Harness> {
    harness_with(options, StoreHooks::default())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn payload(store: &RecordStore, addr: RecordAddr, prop: PropId) -> Result<Option<SlotPayload>> {
    let record = store.read(addr, LoadMode::Lazy)?;
    Ok(record.slot(prop).map(|s| s.payload.clone()))
}

pub fn values(store: &RecordStore, addr: RecordAddr, prop: PropId) -> Result<Vec<Value>> {
    Ok(store
        .collection_values(addr, prop)?
        .into_iter()
        .map(|(_, v)| v)
        .collect())
}
