//! Per-table configuration.
//!
//! Each table carries a configuration string in the metadata catalog; the
//! handle layer owns the string and the tree parses it into a `BtreeConfig`.
//! Configuration strings are JSON, round-tripped with serde.

use burrow_common::constants::{
    DEFAULT_ALLOC_SIZE, DEFAULT_MAX_INTL_ITEM, DEFAULT_MAX_INTL_PAGE, DEFAULT_MAX_LEAF_ITEM,
    DEFAULT_MAX_LEAF_PAGE, DEFAULT_SPLIT_PCT,
};
use burrow_common::{BurrowError, BurrowResult};
use serde::{Deserialize, Serialize};

/// Configuration for a single table's backing tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BtreeConfig {
    /// Maximum leaf page size in bytes.
    pub max_leaf_page: usize,

    /// Maximum internal page size in bytes.
    pub max_intl_page: usize,

    /// Maximum leaf item size; larger items are promoted to overflow blocks.
    pub max_leaf_item: usize,

    /// Maximum internal item size; larger keys are promoted to overflow.
    pub max_intl_item: usize,

    /// Block allocation unit; split sizes are rounded up to a multiple.
    pub alloc_size: usize,

    /// Split percentage: split chunks target this fraction of the maximum
    /// page size. Tunable; 75 by default.
    pub split_pct: u32,

    /// Whether leading key bytes shared with the previous key are elided.
    pub prefix_compression: bool,

    /// Whether promoted internal keys are truncated to the minimum length
    /// that still distinguishes them from the preceding leaf's last key.
    pub internal_key_truncate: bool,

    /// Bit width of fixed-width column-store records (1-8).
    pub fixed_bit_width: u8,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            max_leaf_page: DEFAULT_MAX_LEAF_PAGE,
            max_intl_page: DEFAULT_MAX_INTL_PAGE,
            max_leaf_item: DEFAULT_MAX_LEAF_ITEM,
            max_intl_item: DEFAULT_MAX_INTL_ITEM,
            alloc_size: DEFAULT_ALLOC_SIZE,
            split_pct: DEFAULT_SPLIT_PCT,
            prefix_compression: true,
            internal_key_truncate: true,
            fixed_bit_width: 8,
        }
    }
}

impl BtreeConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum leaf page size.
    #[must_use]
    pub fn with_max_leaf_page(mut self, size: usize) -> Self {
        self.max_leaf_page = size;
        self
    }

    /// Sets the maximum internal page size.
    #[must_use]
    pub fn with_max_intl_page(mut self, size: usize) -> Self {
        self.max_intl_page = size;
        self
    }

    /// Sets the maximum leaf item size.
    #[must_use]
    pub fn with_max_leaf_item(mut self, size: usize) -> Self {
        self.max_leaf_item = size;
        self
    }

    /// Sets the maximum internal item size.
    #[must_use]
    pub fn with_max_intl_item(mut self, size: usize) -> Self {
        self.max_intl_item = size;
        self
    }

    /// Sets the block allocation unit.
    #[must_use]
    pub fn with_alloc_size(mut self, size: usize) -> Self {
        self.alloc_size = size;
        self
    }

    /// Sets the split percentage, clamped to 1..=100.
    #[must_use]
    pub fn with_split_pct(mut self, pct: u32) -> Self {
        self.split_pct = pct.clamp(1, 100);
        self
    }

    /// Enables or disables prefix compression.
    #[must_use]
    pub fn with_prefix_compression(mut self, enable: bool) -> Self {
        self.prefix_compression = enable;
        self
    }

    /// Enables or disables internal key truncation.
    #[must_use]
    pub fn with_internal_key_truncate(mut self, enable: bool) -> Self {
        self.internal_key_truncate = enable;
        self
    }

    /// Sets the fixed-width column bit width, clamped to 1..=8.
    #[must_use]
    pub fn with_fixed_bit_width(mut self, bits: u8) -> Self {
        self.fixed_bit_width = bits.clamp(1, 8);
        self
    }

    /// Serializes the configuration to a catalog config string.
    #[must_use]
    pub fn to_config_string(&self) -> String {
        serde_json::to_string(self).expect("config serialization is infallible")
    }

    /// Parses a catalog config string.
    pub fn from_config_string(s: &str) -> BurrowResult<Self> {
        serde_json::from_str(s).map_err(|e| BurrowError::InvalidConfig {
            message: e.to_string(),
        })
    }

    /// Creates a small-page configuration for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_leaf_page: 2 * 1024,
            max_intl_page: 1024,
            max_leaf_item: 512,
            max_intl_item: 256,
            alloc_size: 64,
            split_pct: 75,
            prefix_compression: true,
            internal_key_truncate: true,
            fixed_bit_width: 8,
        }
    }
}
