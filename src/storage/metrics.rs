use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking record engine activity.
///
/// Implementations receive one call per structural event (record creation,
/// migration, spill, promotion, reclaim) and one per applied mutation call.
pub trait StoreMetrics: Send + Sync {
    /// Records the creation of a node record.
    fn record_created(&self);

    /// Records a record moving to a new page.
    fn record_migrated(&self);

    /// Records a property value moving to the overflow store.
    fn value_spilled(&self);

    /// Records a small collection becoming a big collection.
    fn collection_promoted(&self);

    /// Records an overflow chain being released.
    ///
    /// # Parameters
    /// * `deferred` - Whether reclaim had to wait for active readers.
    fn overflow_reclaimed(&self, deferred: bool);

    /// Records a committed mutation call carrying `parts` property images.
    fn mutation_applied(&self, parts: usize);
}

/// A no-op implementation of [`StoreMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn record_created(&self) {}
    fn record_migrated(&self) {}
    fn value_spilled(&self) {}
    fn collection_promoted(&self) {}
    fn overflow_reclaimed(&self, _deferred: bool) {}
    fn mutation_applied(&self, _parts: usize) {}
}

/// A thread-safe counter-based implementation of [`StoreMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of records created.
    pub records_created: AtomicU64,

    /// Number of record migrations.
    pub records_migrated: AtomicU64,

    /// Number of values spilled to overflow.
    pub values_spilled: AtomicU64,

    /// Number of collection promotions.
    pub collections_promoted: AtomicU64,

    /// Number of overflow chains freed immediately.
    pub overflow_reclaimed_now: AtomicU64,

    /// Number of overflow chains whose reclaim waited for readers.
    pub overflow_reclaimed_deferred: AtomicU64,

    /// Number of committed mutation calls.
    pub mutations_applied: AtomicU64,

    /// Property images written across all mutation calls.
    pub mutation_parts: AtomicU64,
}

impl StoreMetrics for CounterMetrics {
    fn record_created(&self) {
        self.records_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_migrated(&self) {
        self.records_migrated.fetch_add(1, Ordering::Relaxed);
    }

    fn value_spilled(&self) {
        self.values_spilled.fetch_add(1, Ordering::Relaxed);
    }

    fn collection_promoted(&self) {
        self.collections_promoted.fetch_add(1, Ordering::Relaxed);
    }

    fn overflow_reclaimed(&self, deferred: bool) {
        if deferred {
            self.overflow_reclaimed_deferred.fetch_add(1, Ordering::Relaxed);
        } else {
            self.overflow_reclaimed_now.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn mutation_applied(&self, parts: usize) {
        self.mutations_applied.fetch_add(1, Ordering::Relaxed);
        self.mutation_parts.fetch_add(parts as u64, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn StoreMetrics> {
    Arc::new(NoopMetrics)
}
