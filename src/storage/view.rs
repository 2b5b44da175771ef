use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::types::{NodeId, PropId, RecordAddr};

use super::record::{NodeRecord, PropertySlot};

struct ViewState {
    addr: RecordAddr,
    record: NodeRecord,
    version: u64,
    purged: bool,
}

/// Live in-process view of one record, refreshed after every successful
/// mutation of that record.
#[derive(Clone)]
pub struct RecordView {
    state: Arc<RwLock<ViewState>>,
}

impl RecordView {
    /// Current address of the record.
    pub fn addr(&self) -> RecordAddr {
        self.state.read().addr
    }

    /// Copy of the record as of the last refresh.
    pub fn record(&self) -> NodeRecord {
        self.state.read().record.clone()
    }

    /// Slot of `prop` as of the last refresh.
    pub fn slot(&self, prop: PropId) -> Option<PropertySlot> {
        self.state.read().record.slot(prop).cloned()
    }

    /// Number of refreshes applied since the view was opened.
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Returns true once the record has been purged.
    pub fn is_purged(&self) -> bool {
        self.state.read().purged
    }
}

#[derive(Default)]
pub(crate) struct ViewRegistry {
    views: Mutex<HashMap<NodeId, Vec<Weak<RwLock<ViewState>>>>>,
}

impl ViewRegistry {
    pub(crate) fn register(&self, addr: RecordAddr, record: NodeRecord) -> RecordView {
        let node = record.node;
        let state = Arc::new(RwLock::new(ViewState {
            addr,
            record,
            version: 0,
            purged: false,
        }));
        self.views
            .lock()
            .entry(node)
            .or_default()
            .push(Arc::downgrade(&state));
        RecordView { state }
    }

    fn live(&self, node: NodeId) -> Vec<Arc<RwLock<ViewState>>> {
        let mut views = self.views.lock();
        let Some(entries) = views.get_mut(&node) else {
            return Vec::new();
        };
        let live: Vec<_> = entries.iter().filter_map(Weak::upgrade).collect();
        entries.retain(|w| w.strong_count() > 0);
        if entries.is_empty() {
            views.remove(&node);
        }
        live
    }

    /// Publishes `record` at `addr` to every open view of it.
    pub(crate) fn refresh(&self, addr: RecordAddr, record: &NodeRecord) -> usize {
        let live = self.live(record.node);
        for state in &live {
            let mut state = state.write();
            state.addr = addr;
            state.record = record.clone();
            state.version += 1;
        }
        if !live.is_empty() {
            trace!(node = record.node.0, views = live.len(), "view.refresh");
        }
        live.len()
    }

    pub(crate) fn purge(&self, node: NodeId) {
        for state in self.live(node) {
            let mut state = state.write();
            state.purged = true;
            state.version += 1;
        }
        self.views.lock().remove(&node);
    }
}
