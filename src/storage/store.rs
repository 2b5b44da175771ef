#![forbid(unsafe_code)]
//! Record store facade: record lifecycle on top of a [`PageStore`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::primitives::pager::{LockMode, LogOp, PageLock, PageStore, PageTxn};
use crate::types::{BatchError, ElementId, Lsn, NodeId, PageId, PropId, RecordAddr, Result, StoreError};

use super::codec::{self, Decoded, LoadMode};
use super::collection::{self, big, BigView, Direction, ElementRead, ElementValue};
use super::hooks::{ChangeEvent, EventKind, StoreHooks};
use super::metrics::{default_metrics, StoreMetrics};
use super::mutation::{self, MutationBatch, MutationOutcome};
use super::options::{OptionsError, StoreOptions};
use super::overflow::{OverflowRef, OverflowStore, OverflowStream, Reclaim};
use super::page::{self, RecordsPage};
use super::record::{record_flags, NodeRecord, RecordImage, SlotPayload};
use super::value::Value;
use super::view::{RecordView, ViewRegistry};

/// Longest forwarding chain followed before the record is reported corrupted.
pub const MAX_FORWARD_HOPS: usize = 32;

pub(crate) struct StoreContext {
    pub(crate) options: StoreOptions,
    pub(crate) store: Arc<dyn PageStore>,
    pub(crate) overflow: OverflowStore,
    pub(crate) hooks: StoreHooks,
    pub(crate) metrics: Arc<dyn StoreMetrics>,
    pub(crate) views: ViewRegistry,
    pub(crate) insert_hint: Mutex<Option<PageId>>,
}

/// A record found by following forwarding stubs, with its page locked.
pub(crate) struct Located {
    pub(crate) lock: PageLock,
    pub(crate) addr: RecordAddr,
    /// Stub addresses walked, oldest first.
    pub(crate) stubs: Vec<RecordAddr>,
    pub(crate) record: NodeRecord,
    pub(crate) bytes: Vec<u8>,
    /// Free bytes of the page, excluding the record itself.
    pub(crate) free: usize,
}

impl StoreContext {
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.options.read_only || self.store.read_only() {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Follows forwarding stubs from `addr`, locking each page in `mode`
    /// and keeping only the final lock.
    pub(crate) fn locate(&self, addr: RecordAddr, mode: LockMode) -> Result<Located> {
        let timeout = self.options.lock_timeout();
        let mut cur = addr;
        let mut stubs = Vec::new();
        let mut node: Option<NodeId> = None;
        loop {
            if stubs.len() > MAX_FORWARD_HOPS {
                return Err(StoreError::Corrupted("forwarding chain too long"));
            }
            let lock = self.store.lock(cur.page, mode, timeout)?;
            let data = self.store.get_page(cur.page)?;
            page::check(&data, cur.page)?;
            let bytes = page::read(&data, cur.slot)?;
            match RecordImage::decode(bytes)? {
                RecordImage::Forward { node: stub_node, to } => {
                    if node.is_some_and(|n| n != stub_node) {
                        return Err(StoreError::Corrupted("forwarding stub node mismatch"));
                    }
                    node = Some(stub_node);
                    stubs.push(cur);
                    drop(lock);
                    cur = to;
                }
                RecordImage::Record(record) => {
                    if node.is_some_and(|n| n != record.node) {
                        return Err(StoreError::Corrupted("forwarding stub node mismatch"));
                    }
                    let free = page::free_space(&data)?;
                    return Ok(Located {
                        lock,
                        addr: cur,
                        stubs,
                        record,
                        bytes: bytes.to_vec(),
                        free,
                    });
                }
            }
        }
    }

    pub(crate) fn emit(&self, event: &ChangeEvent) {
        self.hooks.notifier.emit(event);
    }

    pub(crate) fn release_refs(&self, refs: &[OverflowRef]) {
        for r in refs {
            match self.overflow.release(r) {
                Ok(Reclaim::Now) => self.metrics.overflow_reclaimed(false),
                Ok(Reclaim::Deferred) => self.metrics.overflow_reclaimed(true),
                Err(err) => warn!(page = r.start.0, ?err, "store.reclaim_failed"),
            }
        }
    }
}

fn materialize(ctx: &StoreContext, record: &mut NodeRecord, mode: LoadMode) -> Result<()> {
    if mode == LoadMode::Lazy {
        return Ok(());
    }
    let props: Vec<PropId> = record.slots().iter().map(|s| s.prop).collect();
    for prop in props {
        let Some(slot) = record.slot_mut(prop) else {
            continue;
        };
        match &mut slot.payload {
            SlotPayload::Overflow(r) => {
                if let Decoded::Value(v) = codec::resolve(r, mode, &ctx.overflow)? {
                    slot.payload = SlotPayload::Inline(v);
                }
            }
            SlotPayload::Small(list) => {
                for element in list.elements_mut() {
                    if let ElementValue::Overflow(r) = &element.value {
                        if let Decoded::Value(v) = codec::resolve(r, mode, &ctx.overflow)? {
                            element.value = ElementValue::Inline(v);
                        }
                    }
                }
            }
            SlotPayload::Inline(_) | SlotPayload::Big(_) => {}
        }
    }
    Ok(())
}

fn element_value(ctx: &StoreContext, value: &ElementValue) -> Result<Value> {
    match value {
        ElementValue::Inline(v) => Ok(v.clone()),
        ElementValue::Overflow(r) => {
            let bytes = ctx.overflow.read_value(r)?;
            Value::from_blob(r.tag, bytes)
        }
    }
}

fn options_error(err: OptionsError) -> StoreError {
    match err {
        OptionsError::Invalid(msg) => StoreError::Invalid(msg),
        OptionsError::Read { .. } | OptionsError::Parse { .. } => {
            StoreError::Invalid("store options could not be loaded")
        }
    }
}

/// Embedded node record store.
///
/// Cloning is cheap; clones share the page store and every registry.
#[derive(Clone)]
pub struct RecordStore {
    ctx: Arc<StoreContext>,
}

impl RecordStore {
    /// Opens a record engine over `store`.
    pub fn open(options: StoreOptions, store: Arc<dyn PageStore>, hooks: StoreHooks) -> Result<Self> {
        options.validate().map_err(options_error)?;
        if store.page_size() != options.page_size as usize {
            return Err(StoreError::Invalid("page store size does not match options"));
        }
        let overflow = OverflowStore::new(Arc::clone(&store), options.reader_registry_shards as usize)?;
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        debug!(
            page_size = options.page_size,
            record_budget = options.effective_record_budget(),
            read_only = options.read_only,
            "store.open"
        );
        Ok(Self {
            ctx: Arc::new(StoreContext {
                options,
                store,
                overflow,
                hooks,
                metrics,
                views: ViewRegistry::default(),
                insert_hint: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn context(&self) -> &StoreContext {
        &self.ctx
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.ctx.options
    }

    /// Underlying page store.
    pub fn page_store(&self) -> &Arc<dyn PageStore> {
        &self.ctx.store
    }

    /// Overflow store shared by every record.
    pub fn overflow(&self) -> &OverflowStore {
        &self.ctx.overflow
    }

    /// Metrics sink.
    pub fn metrics(&self) -> &Arc<dyn StoreMetrics> {
        &self.ctx.metrics
    }

    /// Creates a record for `node` holding the result of `batch`.
    pub fn create(&self, node: NodeId, batch: &MutationBatch) -> std::result::Result<RecordAddr, BatchError> {
        mutation::run_create(&self.ctx, node, batch).map(|outcome| outcome.addr)
    }

    /// Like [`RecordStore::create`], returning the full outcome.
    pub fn create_with_outcome(
        &self,
        node: NodeId,
        batch: &MutationBatch,
    ) -> std::result::Result<MutationOutcome, BatchError> {
        mutation::run_create(&self.ctx, node, batch)
    }

    /// Applies `batch` atomically to the record at `addr`.
    pub fn mutate(&self, addr: RecordAddr, batch: &MutationBatch) -> std::result::Result<MutationOutcome, BatchError> {
        mutation::run_mutate(&self.ctx, addr, batch)
    }

    /// Follows forwarding stubs to the record's current address.
    pub fn resolve(&self, addr: RecordAddr) -> Result<RecordAddr> {
        Ok(self.ctx.locate(addr, LockMode::Shared)?.addr)
    }

    /// Reads the record at `addr`. [`LoadMode::Full`] materializes overflowed
    /// values; big collections stay as descriptors.
    pub fn read(&self, addr: RecordAddr, mode: LoadMode) -> Result<NodeRecord> {
        // The page lock keeps writers from releasing chains mid-read.
        let Located { lock, mut record, .. } = self.ctx.locate(addr, LockMode::Shared)?;
        materialize(&self.ctx, &mut record, mode)?;
        drop(lock);
        Ok(record)
    }

    /// Reads one scalar property. Collections are read with
    /// [`RecordStore::collection_values`].
    pub fn property(&self, addr: RecordAddr, prop: PropId, mode: LoadMode) -> Result<Option<Decoded>> {
        let located = self.ctx.locate(addr, LockMode::Shared)?;
        let decoded = match located.record.slot(prop).map(|s| &s.payload) {
            None => None,
            Some(SlotPayload::Inline(v)) => Some(Decoded::Value(v.clone())),
            Some(SlotPayload::Overflow(r)) => Some(codec::resolve(r, mode, &self.ctx.overflow)?),
            Some(SlotPayload::Small(_) | SlotPayload::Big(_)) => {
                return Err(StoreError::Invalid("property is a collection"))
            }
        };
        drop(located);
        Ok(decoded)
    }

    fn collection(&self, addr: RecordAddr, prop: PropId, direction: Direction) -> Result<Vec<(ElementId, Value)>> {
        let located = self.ctx.locate(addr, LockMode::Shared)?;
        let slot = located
            .record
            .slot(prop)
            .ok_or(StoreError::NotFound("property"))?;
        let mut out = Vec::new();
        match &slot.payload {
            SlotPayload::Small(list) => {
                for id in collection::ids(list, direction)? {
                    let element = list.get(id)?.ok_or(StoreError::Corrupted("collection link to missing element"))?;
                    out.push((id, element_value(&self.ctx, &element.value)?));
                }
            }
            SlotPayload::Big(desc) => {
                let view = BigView::new(&*self.ctx.store, desc);
                for id in collection::ids(&view, direction)? {
                    let element = view.get(id)?.ok_or(StoreError::Corrupted("collection link to missing element"))?;
                    out.push((id, element_value(&self.ctx, &element.value)?));
                }
            }
            SlotPayload::Inline(_) | SlotPayload::Overflow(_) => {
                return Err(StoreError::Invalid("property is not a collection"))
            }
        }
        Ok(out)
    }

    /// Elements of a collection property in logical order.
    pub fn collection_values(&self, addr: RecordAddr, prop: PropId) -> Result<Vec<(ElementId, Value)>> {
        self.collection(addr, prop, Direction::Forward)
    }

    /// Elements of a collection property in reverse logical order.
    pub fn collection_values_rev(&self, addr: RecordAddr, prop: PropId) -> Result<Vec<(ElementId, Value)>> {
        self.collection(addr, prop, Direction::Backward)
    }

    /// Opens a stream over an overflowed property. The stream stays valid if
    /// the property is deleted while it is open.
    pub fn open_overflow(&self, addr: RecordAddr, prop: PropId) -> Result<OverflowStream> {
        let located = self.ctx.locate(addr, LockMode::Shared)?;
        let slot = located
            .record
            .slot(prop)
            .ok_or(StoreError::NotFound("property"))?;
        let SlotPayload::Overflow(r) = &slot.payload else {
            return Err(StoreError::Invalid("property is not stored out of line"));
        };
        self.ctx.overflow.open(r)
    }

    /// Opens a live view of the record at `addr`.
    pub fn view(&self, addr: RecordAddr) -> Result<RecordView> {
        let located = self.ctx.locate(addr, LockMode::Shared)?;
        Ok(self.ctx.views.register(located.addr, located.record))
    }

    /// Sets or clears the hidden flag. Returns `None` when nothing changed.
    pub fn set_hidden(&self, addr: RecordAddr, hidden: bool) -> Result<Option<Lsn>> {
        let (set, clear, kind) = if hidden {
            (record_flags::HIDDEN, 0, EventKind::Hidden)
        } else {
            (0, record_flags::HIDDEN, EventKind::Unhidden)
        };
        mutation::commit_flags(&self.ctx, addr, set, clear, kind)
    }

    /// Marks the record deleted; its storage stays until [`RecordStore::purge`].
    pub fn soft_delete(&self, addr: RecordAddr) -> Result<Option<Lsn>> {
        mutation::commit_flags(&self.ctx, addr, record_flags::SOFT_DELETED, 0, EventKind::SoftDeleted)
    }

    /// Physically removes a soft-deleted record, its forwarding stubs, its
    /// big-collection pages, and its overflow chains.
    pub fn purge(&self, addr: RecordAddr) -> Result<Lsn> {
        let ctx = &*self.ctx;
        ctx.check_writable()?;
        let timeout = ctx.options.lock_timeout();
        let mut located = ctx.locate(addr, LockMode::Upgrade)?;
        if !located.record.has_flag(record_flags::SOFT_DELETED) {
            return Err(StoreError::Invalid("record is not soft-deleted"));
        }
        let mut locked = vec![located.addr.page];
        let mut stub_locks = Vec::with_capacity(located.stubs.len());
        for stub in &located.stubs {
            if !locked.contains(&stub.page) {
                locked.push(stub.page);
                stub_locks.push(ctx.store.lock(stub.page, LockMode::Upgrade, timeout)?);
            }
        }
        let record = &located.record;
        let mut txn = PageTxn::new(Arc::clone(&ctx.store));
        let mut refs = Vec::new();
        for slot in record.slots() {
            match &slot.payload {
                SlotPayload::Big(desc) => refs.extend(big::release(&mut txn, desc)?),
                other => refs.extend(other.overflow_refs()),
            }
        }
        let mut emptied = Vec::new();
        for at in located.stubs.iter().chain(std::iter::once(&located.addr)) {
            let data = txn.page_mut(at.page)?;
            RecordsPage::new(data).remove(at.slot)?;
            if page::live_slots(data)?.is_empty() && !emptied.contains(&at.page) {
                emptied.push(at.page);
            }
        }
        for id in &emptied {
            txn.free(*id)?;
        }
        for lock in stub_locks.iter_mut() {
            lock.upgrade(timeout)?;
        }
        located.lock.upgrade(timeout)?;
        let lsn = txn.commit(LogOp::Purge)?;
        {
            let mut hint = ctx.insert_hint.lock();
            if hint.is_some_and(|p| emptied.contains(&p)) {
                *hint = None;
            }
        }
        drop(stub_locks);
        drop(located.lock);
        ctx.release_refs(&refs);
        ctx.views.purge(located.record.node);
        ctx.emit(&ChangeEvent::record(EventKind::Purged, located.record.node));
        debug!(
            node = located.record.node.0,
            stubs = located.stubs.len(),
            chains = refs.len(),
            pages_freed = emptied.len(),
            lsn = lsn.0,
            "store.purge"
        );
        Ok(lsn)
    }
}
