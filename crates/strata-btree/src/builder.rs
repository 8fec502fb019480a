//! Bottom-up bulk construction of a tree from a sorted stream.
//!
//! The builder never descends the tree. Values are appended to an
//! in-progress leaf; finished leaves queue up in a per-level FIFO of
//! `(handle, first_key)` pairs, and whenever a level holds more than
//! `node_min + node_max` entries, `node_max` of them are packed into a
//! branch node one level up. Reducing at `node_max` alone could leave the
//! final node of a layer with fewer than `node_min` children; the larger
//! threshold guarantees the second-to-last emit of `finish_layer` leaves
//! at least `node_min` behind.

use crate::branch::BranchView;
use crate::leaf::LeafView;
use crate::traits::TreeTraits;
use crate::tree::BTree;
use crate::types::{BuilderState, FuseOutcome};
use std::collections::VecDeque;
use strata_common::{BlockBuffer, BlockHandle, Result, StrataError};
use tracing::trace;

struct LayerEntry<K> {
    handle: BlockHandle,
    first_key: K,
}

/// Assembles a balanced tree from values pushed in key order.
///
/// Call [`push`](BTreeBuilder::push) for each value of the sorted sequence
/// and [`end`](BTreeBuilder::end) exactly once when done; `end` installs
/// the finished root into the tree.
pub struct BTreeBuilder<'t, T: TreeTraits> {
    tree: &'t mut BTree<T>,
    state: BuilderState,
    /// One FIFO per level; index 0 holds finished leaves.
    layers: Vec<VecDeque<LayerEntry<T::Key>>>,
    /// Leaf currently being filled; allocated on first push.
    leaf_buf: Option<BlockBuffer>,
    /// Key of the first value in the current leaf.
    leaf_first_key: Option<T::Key>,
}

impl<'t, T: TreeTraits> BTreeBuilder<'t, T> {
    /// Creates a builder targeting `tree`, which must be open.
    pub fn new(tree: &'t mut BTree<T>) -> Result<Self> {
        if !tree.collection.is_open() {
            return Err(StrataError::NotOpen);
        }
        Ok(Self {
            tree,
            state: BuilderState::Empty,
            layers: vec![VecDeque::new()],
            leaf_buf: None,
            leaf_first_key: None,
        })
    }

    /// Appends the next value of the sorted sequence.
    pub fn push(&mut self, value: T::Value) -> Result<()> {
        if self.state == BuilderState::Built {
            return Err(StrataError::BuilderFinalized);
        }
        self.state = BuilderState::Building;

        let params = self.tree.params;
        let roll = match &mut self.leaf_buf {
            None => false,
            Some(buf) => LeafView::<T>::new(buf, params).full(),
        };
        if roll {
            self.flush_leaf()?;
        }
        if self.leaf_buf.is_none() {
            let mut buf = self.tree.collection.allocate_buffer()?;
            LeafView::<T>::new(&mut buf, params).clear();
            self.leaf_buf = Some(buf);
        }

        let buf = match &mut self.leaf_buf {
            Some(buf) => buf,
            None => return Err(internal("builder lost its leaf buffer")),
        };
        let mut leaf = LeafView::<T>::new(buf, params);
        if leaf.empty() {
            self.leaf_first_key = Some(T::key_of_value(&value));
        }
        leaf.insert(&value);
        Ok(())
    }

    /// Finalizes the tree. Valid once; on an empty builder the tree is
    /// left untouched.
    pub fn end(&mut self) -> Result<()> {
        match self.state {
            BuilderState::Built => return Err(StrataError::BuilderFinalized),
            BuilderState::Empty => {
                self.state = BuilderState::Built;
                return Ok(());
            }
            BuilderState::Building => {}
        }

        self.flush_final_leaf()?;

        let mut level = 0;
        while level < self.layers.len() {
            if level == self.layers.len() - 1 && self.layers[level].len() == 1 {
                break;
            }
            self.finish_layer(level)?;
            level += 1;
        }

        let top = self.layers.len() - 1;
        let root = match self.layers[top].front() {
            Some(entry) => entry.handle,
            None => return Err(internal("builder finished with an empty top layer")),
        };
        self.tree.set_root(root, top);
        trace!(root = root.id(), height = top, "bulk build finished");
        self.state = BuilderState::Built;
        Ok(())
    }

    /// Queues the in-progress leaf and reduces the leaf layer.
    fn flush_leaf(&mut self) -> Result<()> {
        let buf = match self.leaf_buf.take() {
            Some(buf) => buf,
            None => return Err(internal("builder flushed a missing leaf")),
        };
        let first_key = match self.leaf_first_key.take() {
            Some(key) => key,
            None => return Err(internal("builder flushed a leaf without a first key")),
        };
        self.tree.collection.write(&buf)?;
        self.layers[0].push_back(LayerEntry {
            handle: buf.handle(),
            first_key,
        });
        self.reduce_layer(0)
    }

    /// Flushes the last leaf at `end` time.
    ///
    /// Every other leaf is emitted full, so only this one can be below
    /// `leaf_min`; when it is, its values are redistributed with the
    /// previous leaf so the finished tree has no underfull leaf.
    fn flush_final_leaf(&mut self) -> Result<()> {
        let params = self.tree.params;
        let underfull = match &mut self.leaf_buf {
            None => return Ok(()),
            Some(buf) => LeafView::<T>::new(buf, params).underfull(),
        };
        if !underfull || self.layers[0].is_empty() {
            return self.flush_leaf();
        }

        let mut final_buf = match self.leaf_buf.take() {
            Some(buf) => buf,
            None => return Err(internal("builder lost its final leaf")),
        };
        self.leaf_first_key = None;
        let prev = match self.layers[0].pop_back() {
            Some(entry) => entry,
            None => return Err(internal("builder has no leaf to share with")),
        };
        let mut prev_buf = self.tree.collection.read(prev.handle)?;

        let outcome = {
            let mut left = LeafView::<T>::new(&mut prev_buf, params);
            let mut right = LeafView::<T>::new(&mut final_buf, params);
            left.fuse_with(&mut right)
        };
        self.tree.collection.write(&prev_buf)?;
        match outcome {
            FuseOutcome::Shared { pivot } => {
                self.tree.collection.write(&final_buf)?;
                self.layers[0].push_back(prev);
                self.layers[0].push_back(LayerEntry {
                    handle: final_buf.handle(),
                    first_key: pivot,
                });
            }
            FuseOutcome::Merged => {
                self.tree.collection.free_buffer(&final_buf)?;
                self.layers[0].push_back(prev);
            }
        }
        Ok(())
    }

    /// While `level` holds more than `node_min + node_max` entries, packs
    /// `node_max`-fanout nodes one level up, then reduces that level.
    fn reduce_layer(&mut self, level: usize) -> Result<()> {
        let threshold = self.tree.params.node_min + self.tree.params.node_max;
        if self.layers[level].len() > threshold {
            while self.layers[level].len() > threshold {
                let fanout = self.tree.params.node_max;
                self.emit_node(fanout, level + 1)?;
            }
            self.reduce_layer(level + 1)?;
        }
        Ok(())
    }

    /// Drains `level` completely into nodes at `level + 1`.
    fn finish_layer(&mut self, level: usize) -> Result<()> {
        let min = self.tree.params.node_min;
        let max = self.tree.params.node_max;

        while self.layers[level].len() > min + max {
            self.emit_node(max, level + 1)?;
        }
        if self.layers[level].len() > max {
            // Leaves exactly `min` entries for the last node.
            let fanout = self.layers[level].len() - min;
            self.emit_node(fanout, level + 1)?;
        }
        if !self.layers[level].is_empty() {
            let fanout = self.layers[level].len();
            self.emit_node(fanout, level + 1)?;
        }
        Ok(())
    }

    /// Packs the first `children` entries of `level - 1` into one branch
    /// node and queues it on `level`.
    fn emit_node(&mut self, children: usize, level: usize) -> Result<()> {
        if level == self.layers.len() {
            self.layers.push(VecDeque::new());
        }

        let params = self.tree.params;
        let mut buf = self.tree.collection.allocate_buffer()?;
        let first_key = match self.layers[level - 1].front() {
            Some(entry) => entry.first_key,
            None => return Err(internal("builder emitted a node from an empty layer")),
        };

        {
            let mut node = BranchView::<T>::new(&mut buf, params);
            node.clear();
            for i in 0..children {
                let entry = match self.layers[level - 1].pop_front() {
                    Some(entry) => entry,
                    None => return Err(internal("builder layer ran dry mid-node")),
                };
                if i == 0 {
                    node.push_first_child(entry.handle);
                } else {
                    node.push_child(&entry.first_key, entry.handle);
                }
            }
        }
        self.tree.collection.write(&buf)?;
        self.layers[level].push_back(LayerEntry {
            handle: buf.handle(),
            first_key,
        });
        Ok(())
    }
}

fn internal(message: &str) -> StrataError {
    StrataError::InvariantViolated(message.to_string())
}
