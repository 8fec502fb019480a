//! Configuration structures for Strata.

use crate::block::{NodeHeader, BLOCK_SIZE, MAX_TREE_HEIGHT};
use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};

/// Size of a child handle inside a branch node, in bytes.
const CHILD_HANDLE_LEN: usize = 8;

/// Occupancy bounds for tree nodes.
///
/// A branch node holds between `node_min` and `node_max` children; a leaf
/// holds between `leaf_min` and `leaf_max` values. The root is exempt from
/// the lower bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParameters {
    /// Minimum number of children in a non-root branch node.
    pub node_min: usize,
    /// Maximum number of children in a branch node.
    pub node_max: usize,
    /// Minimum number of values in a non-root leaf.
    pub leaf_min: usize,
    /// Maximum number of values in a leaf.
    pub leaf_max: usize,
}

impl TreeParameters {
    /// Creates parameters after checking the occupancy bounds.
    ///
    /// Requires `node_min >= 2`, `node_max >= 2 * node_min - 1`,
    /// `leaf_min >= 2` and `leaf_max >= 2 * leaf_min - 1`, so that any
    /// split or share of a just-overflowed node leaves both halves at or
    /// above the minimum.
    pub fn new(
        node_min: usize,
        node_max: usize,
        leaf_min: usize,
        leaf_max: usize,
    ) -> Result<Self> {
        let params = Self {
            node_min,
            node_max,
            leaf_min,
            leaf_max,
        };
        params.validate()?;
        Ok(params)
    }

    /// Checks the occupancy bounds.
    pub fn validate(&self) -> Result<()> {
        if self.node_min < 2 {
            return Err(invalid("node_min must be at least 2"));
        }
        if self.node_max < 2 * self.node_min - 1 {
            return Err(invalid("node_max must be at least 2 * node_min - 1"));
        }
        if self.leaf_min < 2 {
            return Err(invalid("leaf_min must be at least 2"));
        }
        if self.leaf_max < 2 * self.leaf_min - 1 {
            return Err(invalid("leaf_max must be at least 2 * leaf_min - 1"));
        }
        Ok(())
    }

    /// Derives the largest parameters whose node bodies fit in one block.
    ///
    /// `key_len` and `value_len` are the encoded sizes of the tree's key
    /// and value types. An advisory `memory_budget` (bytes) caps the
    /// branching factor so the bulk builder's in-memory layer queues stay
    /// within roughly half the budget; it affects nothing else.
    pub fn derive(
        key_len: usize,
        value_len: usize,
        memory_budget: Option<usize>,
    ) -> Result<Self> {
        let body = BLOCK_SIZE - NodeHeader::SIZE;
        let mut leaf_max = body / value_len;
        // A branch stores one more child handle than keys.
        let mut node_max = (body - CHILD_HANDLE_LEN) / (CHILD_HANDLE_LEN + key_len);

        if let Some(budget) = memory_budget {
            // The builder queues up to 2 * node_max (handle, key) entries
            // per layer; keep all layers within half the budget.
            let per_entry = CHILD_HANDLE_LEN + key_len;
            let cap = budget / (4 * MAX_TREE_HEIGHT * per_entry);
            node_max = node_max.min(cap.max(3));
            let leaf_cap = budget / (4 * MAX_TREE_HEIGHT * value_len);
            leaf_max = leaf_max.min(leaf_cap.max(3));
        }

        if leaf_max < 3 || node_max < 3 {
            return Err(invalid("block size too small for key/value sizes"));
        }

        Self::new(
            (node_max + 3).div_ceil(4),
            node_max,
            (leaf_max + 3).div_ceil(4),
            leaf_max,
        )
    }
}

/// Configuration for a block collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Enable fsync after block writes.
    pub fsync_enabled: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            fsync_enabled: false,
        }
    }
}

/// Configuration for a B+ tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Explicit occupancy bounds; derived from the block size when absent.
    pub parameters: Option<TreeParameters>,
    /// Advisory memory budget in bytes, used only to size the fanout.
    pub memory_budget: Option<usize>,
    /// Collection-level settings.
    pub collection: CollectionConfig,
}

fn invalid(reason: &str) -> StrataError {
    StrataError::InvalidParameters {
        reason: reason.to_string(),
    }
}
