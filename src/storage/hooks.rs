//! Collaborators invoked after a mutation commits: derived-view maintenance
//! and change notification.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{ElementId, NodeId, PropId, Result};

use super::record::NodeRecord;
use super::value::Value;

/// Identifier of a derived view maintained outside the engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ViewId(pub u32);

/// Change applied to a derived view.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ViewOp {
    /// The record entered the view.
    Insert,
    /// The record stayed in the view with new contents.
    Update,
    /// The record left the view.
    Remove,
}

/// Derived-view maintenance.
pub trait ViewMaintenance: Send + Sync {
    /// Views whose membership depends on `record`.
    fn detect(&self, record: &NodeRecord) -> Vec<ViewId>;
    /// Applies `op` for `record` to `view`.
    fn update_view(&self, view: ViewId, op: ViewOp, record: &NodeRecord) -> Result<()>;
}

/// Kind of change notification.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    /// A full-text property appeared or became indexable.
    IndexableAdded,
    /// A full-text property disappeared or stopped being indexable.
    IndexableRemoved,
    /// The value (or an element) of a full-text property changed.
    IndexedValueChanged,
    /// The record was hidden.
    Hidden,
    /// The record became visible again.
    Unhidden,
    /// The record was soft-deleted.
    SoftDeleted,
    /// The record was physically removed.
    Purged,
}

/// One change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    /// What happened.
    pub kind: EventKind,
    /// Record concerned.
    pub node: NodeId,
    /// Property concerned, for property-level events.
    pub prop: Option<PropId>,
    /// Element concerned, for element-level events.
    pub element: Option<ElementId>,
    /// Previous inline value, when known.
    pub old: Option<Value>,
    /// New inline value, when known.
    pub new: Option<Value>,
}

impl ChangeEvent {
    /// Record-level event without property details.
    pub fn record(kind: EventKind, node: NodeId) -> Self {
        Self {
            kind,
            node,
            prop: None,
            element: None,
            old: None,
            new: None,
        }
    }
}

/// Change notification sink.
pub trait Notifier: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: &ChangeEvent);
}

/// Maintains no views.
#[derive(Default)]
pub struct NoViews;

impl ViewMaintenance for NoViews {
    fn detect(&self, _record: &NodeRecord) -> Vec<ViewId> {
        Vec::new()
    }

    fn update_view(&self, _view: ViewId, _op: ViewOp, _record: &NodeRecord) -> Result<()> {
        Ok(())
    }
}

/// Discards every event.
#[derive(Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn emit(&self, _event: &ChangeEvent) {}
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ChangeEvent>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the recorded events.
    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl Notifier for EventLog {
    fn emit(&self, event: &ChangeEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Collaborators handed to [`super::RecordStore::open`].
#[derive(Clone)]
pub struct StoreHooks {
    /// Derived-view maintenance.
    pub views: Arc<dyn ViewMaintenance>,
    /// Change notification sink.
    pub notifier: Arc<dyn Notifier>,
}

impl Default for StoreHooks {
    fn default() -> Self {
        Self {
            views: Arc::new(NoViews),
            notifier: Arc::new(NoopNotifier),
        }
    }
}

impl StoreHooks {
    /// Sets the view maintenance collaborator.
    pub fn views(mut self, views: Arc<dyn ViewMaintenance>) -> Self {
        self.views = views;
        self
    }

    /// Sets the notification sink.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
