use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::collection::big::{index_page_len, DESCRIPTOR_FIXED_LEN, LEAF_HDR_END};
use crate::storage::metrics::StoreMetrics;
use crate::storage::page::MAX_RECORD_OVERHEAD;
use crate::types::page::DEFAULT_PAGE_SIZE;

/// Smallest page size a store accepts.
pub const MIN_PAGE_SIZE: u32 = 256;
/// Largest page size a store accepts; slot offsets are 16-bit.
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;

/// Errors raised while loading or validating [`StoreOptions`].
#[derive(Debug, Error)]
pub enum OptionsError {
    /// The options file could not be read.
    #[error("failed to read store options {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The options file is not valid TOML for [`StoreOptions`].
    #[error("failed to parse store options {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying parse failure.
        source: toml::de::Error,
    },
    /// The option values are inconsistent.
    #[error("invalid store options: {0}")]
    Invalid(&'static str),
}

/// Configuration supplied when opening a [`super::RecordStore`].
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Page size in bytes.
    pub page_size: u32,
    /// Maximum number of pages the store may allocate.
    pub max_pages: Option<u32>,
    /// Per-record byte budget; defaults to the largest record a page holds.
    pub record_budget: Option<u32>,
    /// Values whose encoded size exceeds this are spilled to overflow.
    pub inline_value_limit: u32,
    /// Minimum bytes a spill must save in force-split mode.
    pub force_split_min: u32,
    /// Element count above which a small collection is promoted.
    pub collection_promote_threshold: u32,
    /// Element payloads larger than this go to the overflow store.
    pub element_inline_limit: u32,
    /// Maximum fan-out entries in a big collection node before it splits.
    pub big_fanout_max: u32,
    /// Page lock wait budget in milliseconds.
    pub lock_timeout_ms: u64,
    /// Bucket count of the overflow reader registry.
    pub reader_registry_shards: u32,
    /// Reject every mutation with `ReadOnly`.
    pub read_only: bool,
    /// Optional metrics collection implementation.
    #[serde(skip)]
    pub metrics: Option<Arc<dyn StoreMetrics>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: None,
            record_budget: None,
            inline_value_limit: 256,
            force_split_min: 16,
            collection_promote_threshold: 256,
            element_inline_limit: 128,
            big_fanout_max: 32,
            lock_timeout_ms: 2_000,
            reader_registry_shards: 16,
            read_only: false,
            metrics: None,
        }
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("record_budget", &self.record_budget)
            .field("inline_value_limit", &self.inline_value_limit)
            .field("force_split_min", &self.force_split_min)
            .field("collection_promote_threshold", &self.collection_promote_threshold)
            .field("element_inline_limit", &self.element_inline_limit)
            .field("big_fanout_max", &self.big_fanout_max)
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .field("reader_registry_shards", &self.reader_registry_shards)
            .field("read_only", &self.read_only)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl StoreOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from TOML; missing fields take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(src)
    }

    /// Loads and validates options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| OptionsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options = Self::from_toml_str(&contents).map_err(|source| OptionsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Caps the number of allocatable pages.
    pub fn max_pages(mut self, pages: u32) -> Self {
        self.max_pages = Some(pages);
        self
    }

    /// Sets the per-record byte budget.
    pub fn record_budget(mut self, bytes: u32) -> Self {
        self.record_budget = Some(bytes);
        self
    }

    /// Sets the inline value limit used by normal spill selection.
    pub fn inline_value_limit(mut self, bytes: u32) -> Self {
        self.inline_value_limit = bytes;
        self
    }

    /// Sets the minimum savings of a force-split candidate.
    pub fn force_split_min(mut self, bytes: u32) -> Self {
        self.force_split_min = bytes;
        self
    }

    /// Sets the element count that triggers promotion.
    pub fn collection_promote_threshold(mut self, elements: u32) -> Self {
        self.collection_promote_threshold = elements;
        self
    }

    /// Sets the inline limit of element payloads.
    pub fn element_inline_limit(mut self, bytes: u32) -> Self {
        self.element_inline_limit = bytes;
        self
    }

    /// Sets the big collection fan-out.
    pub fn big_fanout_max(mut self, entries: u32) -> Self {
        self.big_fanout_max = entries;
        self
    }

    /// Sets the lock wait budget.
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// Sets the overflow registry bucket count.
    pub fn reader_registry_shards(mut self, shards: u32) -> Self {
        self.reader_registry_shards = shards;
        self
    }

    /// Enables or disables read-only mode.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn StoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Largest record a page of this size can hold.
    pub fn max_record_len(&self) -> usize {
        (self.page_size as usize).saturating_sub(MAX_RECORD_OVERHEAD)
    }

    /// Effective per-record budget.
    pub fn effective_record_budget(&self) -> usize {
        let max = self.max_record_len();
        self.record_budget.map_or(max, |b| (b as usize).min(max))
    }

    /// Lock wait budget as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Checks that the options describe a usable store.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(OptionsError::Invalid("page_size must be between 256 and 32768"));
        }
        let budget = self.effective_record_budget();
        if self.record_budget.is_some_and(|b| b as usize > self.max_record_len()) {
            return Err(OptionsError::Invalid("record_budget exceeds page capacity"));
        }
        if budget < 64 {
            return Err(OptionsError::Invalid("record_budget must be at least 64 bytes"));
        }
        if self.inline_value_limit < 16 {
            return Err(OptionsError::Invalid("inline_value_limit must be at least 16"));
        }
        if self.collection_promote_threshold == 0 {
            return Err(OptionsError::Invalid("collection_promote_threshold must be positive"));
        }
        let leaf_room = (self.page_size as usize).saturating_sub(LEAF_HDR_END);
        if self.element_inline_limit < 16 || self.element_inline_limit as usize > leaf_room / 4 {
            return Err(OptionsError::Invalid(
                "element_inline_limit must be at least 16 and at most a quarter of a leaf",
            ));
        }
        let fanout = self.big_fanout_max as usize;
        if fanout < 2 {
            return Err(OptionsError::Invalid("big_fanout_max must be at least 2"));
        }
        if index_page_len(fanout) > self.page_size as usize
            || DESCRIPTOR_FIXED_LEN + 8 * fanout > budget / 2
        {
            return Err(OptionsError::Invalid("big_fanout_max too large for page size"));
        }
        if self.reader_registry_shards == 0 {
            return Err(OptionsError::Invalid("reader_registry_shards must be positive"));
        }
        Ok(())
    }
}
