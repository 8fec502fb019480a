//! External-memory B+ tree over a block collection.

use crate::branch::BranchView;
use crate::leaf::LeafView;
use crate::traits::TreeTraits;
use crate::types::{FuseOutcome, TreePath};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::Path;
use strata_blocks::BlockCollection;
use strata_common::{
    BlockBuffer, BlockHandle, Result, StrataError, TreeConfig, TreeParameters,
};
use tempfile::TempPath;
use tracing::trace;

/// A B+ tree whose nodes live in fixed-size blocks of a collection file.
///
/// The tree keeps its root handle and height in memory only; callers that
/// reopen a collection restore them through [`BTree::set_root`] after
/// saving them out of band.
pub struct BTree<T: TreeTraits> {
    pub(crate) collection: BlockCollection,
    pub(crate) root: BlockHandle,
    pub(crate) height: usize,
    pub(crate) params: TreeParameters,
    /// Keeps a temporary backing file alive for `open_temp` trees.
    temp: Option<TempPath>,
    _marker: PhantomData<T>,
}

impl<T: TreeTraits> BTree<T> {
    /// Creates a closed tree with parameters derived from the block size.
    pub fn new() -> Result<Self> {
        Self::with_config(TreeConfig::default())
    }

    /// Creates a closed tree from an explicit configuration.
    pub fn with_config(config: TreeConfig) -> Result<Self> {
        let params = match config.parameters {
            Some(params) => {
                params.validate()?;
                Self::check_fit(&params)?;
                params
            }
            None => TreeParameters::derive(T::KEY_LEN, T::VALUE_LEN, config.memory_budget)?,
        };
        Ok(Self {
            collection: BlockCollection::new(config.collection),
            root: BlockHandle::NULL,
            height: 0,
            params,
            temp: None,
            _marker: PhantomData,
        })
    }

    /// Returns the occupancy bounds in effect.
    pub fn parameters(&self) -> TreeParameters {
        self.params
    }

    /// Replaces the occupancy bounds. Only valid while the tree is closed;
    /// on failure the previous parameters stay in effect.
    pub fn set_parameters(&mut self, params: TreeParameters) -> Result<()> {
        if self.collection.is_open() {
            return Err(StrataError::InvalidParameters {
                reason: "parameters cannot change while the tree is open".to_string(),
            });
        }
        params.validate()?;
        Self::check_fit(&params)?;
        self.params = params;
        Ok(())
    }

    fn check_fit(params: &TreeParameters) -> Result<()> {
        if params.leaf_max > LeafView::<T>::max_fanout()
            || params.node_max > BranchView::<T>::max_fanout()
        {
            return Err(StrataError::InvalidParameters {
                reason: "fanout does not fit in one block".to_string(),
            });
        }
        Ok(())
    }

    /// Attaches the tree to the collection file at `path`, creating it if
    /// missing. The tree starts empty; use [`BTree::set_root`] to restore
    /// externally persisted state.
    pub fn open(&mut self, path: &Path) -> Result<()> {
        self.collection.open(path, true)?;
        self.temp = None;
        self.root = BlockHandle::NULL;
        self.height = 0;
        Ok(())
    }

    /// Attaches the tree to a fresh temporary file, removed on close.
    pub fn open_temp(&mut self) -> Result<()> {
        let temp = tempfile::Builder::new()
            .prefix("strata-btree-")
            .tempfile()?
            .into_temp_path();
        self.collection.open(&temp, true)?;
        self.root = BlockHandle::NULL;
        self.height = 0;
        self.temp = Some(temp);
        Ok(())
    }

    /// Flushes the allocation bitmap and detaches from the file.
    /// Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.collection.close()?;
        self.temp = None;
        Ok(())
    }

    /// Returns the root handle (the null sentinel while the tree is
    /// empty).
    pub fn root(&self) -> BlockHandle {
        self.root
    }

    /// Number of branch levels above the leaves.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Restores tree state persisted outside the collection.
    pub fn set_root(&mut self, root: BlockHandle, height: usize) {
        self.root = root;
        self.height = height;
    }

    fn require_open(&self) -> Result<()> {
        if self.collection.is_open() {
            Ok(())
        } else {
            Err(StrataError::NotOpen)
        }
    }

    /// Descends from the root to the leaf responsible for `key`, recording
    /// each `(block, child_index)` step in `path`.
    fn key_path(&self, key: &T::Key, path: &mut TreePath) -> Result<BlockBuffer> {
        let mut buf = self.collection.read(self.root)?;
        for _ in 0..self.height {
            let (child, index) = {
                let node = BranchView::<T>::new(&mut buf, self.params);
                let index = node.find_child(key);
                (node.child(index), index)
            };
            if child.is_null() {
                return Err(StrataError::InvariantViolated(
                    "descent reached a null child".to_string(),
                ));
            }
            path.follow(buf.handle(), index)?;
            self.collection.read_into(child, &mut buf)?;
        }
        Ok(buf)
    }

    fn leaf_for(&self, key: &T::Key) -> Result<BlockBuffer> {
        let mut path = TreePath::new();
        self.key_path(key, &mut path)
    }

    /// Inserts a value.
    pub fn insert(&mut self, value: T::Value) -> Result<()> {
        self.require_open()?;
        let key = T::key_of_value(&value);

        if self.root.is_null() {
            let mut buf = self.collection.allocate_buffer()?;
            {
                let mut leaf = LeafView::<T>::new(&mut buf, self.params);
                leaf.clear();
                leaf.insert(&value);
            }
            self.collection.write(&buf)?;
            self.root = buf.handle();
            trace!(root = self.root.id(), "created root leaf");
            return Ok(());
        }

        let mut path = TreePath::new();
        let mut leaf_buf = self.key_path(&key, &mut path)?;

        let split = {
            let leaf = LeafView::<T>::new(&mut leaf_buf, self.params);
            leaf.full()
        };
        if !split {
            {
                let mut leaf = LeafView::<T>::new(&mut leaf_buf, self.params);
                leaf.insert(&value);
            }
            return self.collection.write(&leaf_buf);
        }

        // Split the leaf and push the pivot into the ancestors.
        let mut right_buf = self.collection.allocate_buffer()?;
        let pivot = {
            let mut leaf = LeafView::<T>::new(&mut leaf_buf, self.params);
            leaf.split_insert(&value, &mut right_buf)
        };
        self.collection.write(&leaf_buf)?;
        self.collection.write(&right_buf)?;
        trace!(
            left = leaf_buf.handle().id(),
            right = right_buf.handle().id(),
            "leaf split"
        );

        let mut pivot = pivot;
        let mut left = leaf_buf.handle();
        let mut right = right_buf.handle();

        while let Some((parent_handle, child_index)) = path.pop() {
            let mut parent_buf = self.collection.read(parent_handle)?;
            let parent_full = {
                let parent = BranchView::<T>::new(&mut parent_buf, self.params);
                parent.full()
            };

            if !parent_full {
                {
                    let mut parent = BranchView::<T>::new(&mut parent_buf, self.params);
                    parent.insert(child_index, &pivot, left, right);
                }
                return self.collection.write(&parent_buf);
            }

            let mut left_buf = self.collection.allocate_buffer()?;
            let mut right_half_buf = self.collection.allocate_buffer()?;
            let mid = {
                let mut parent = BranchView::<T>::new(&mut parent_buf, self.params);
                parent.split_insert(
                    child_index,
                    &pivot,
                    left,
                    right,
                    &mut left_buf,
                    &mut right_half_buf,
                )
            };
            self.collection.write(&left_buf)?;
            self.collection.write(&right_half_buf)?;
            self.collection.free(parent_handle)?;
            trace!(
                left = left_buf.handle().id(),
                right = right_half_buf.handle().id(),
                "branch split"
            );

            pivot = mid;
            left = left_buf.handle();
            right = right_half_buf.handle();
        }

        // The split reached the root: grow the tree by one level.
        let mut root_buf = self.collection.allocate_buffer()?;
        {
            let mut root = BranchView::<T>::new(&mut root_buf, self.params);
            root.clear();
            root.new_root(&pivot, left, right);
        }
        self.collection.write(&root_buf)?;
        self.root = root_buf.handle();
        self.height += 1;
        trace!(root = self.root.id(), height = self.height, "tree grew");
        Ok(())
    }

    /// Removes the value equal to `key`. Fails with `KeyNotFound` when the
    /// key is absent.
    pub fn erase(&mut self, key: &T::Key) -> Result<()> {
        self.require_open()?;
        if self.root.is_null() {
            return Err(StrataError::KeyNotFound);
        }

        let mut path = TreePath::new();
        let mut leaf_buf = self.key_path(key, &mut path)?;
        let leaf_underfull = {
            let mut leaf = LeafView::<T>::new(&mut leaf_buf, self.params);
            leaf.erase(key)?;
            leaf.underfull()
        };
        self.collection.write(&leaf_buf)?;

        // The root is exempt from the occupancy minimum.
        if path.is_empty() || !leaf_underfull {
            return Ok(());
        }

        // Rebalance at the leaf level.
        let (parent_handle, child_index) = match path.current() {
            Some(step) => step,
            None => return Ok(()),
        };
        let right_index = child_index.max(1);
        let mut parent_buf = self.collection.read(parent_handle)?;
        let (left_handle, right_handle) = {
            let parent = BranchView::<T>::new(&mut parent_buf, self.params);
            (parent.child(right_index - 1), parent.child(right_index))
        };
        let mut left_buf = self.collection.read(left_handle)?;
        let mut right_buf = self.collection.read(right_handle)?;
        let outcome = {
            let mut parent = BranchView::<T>::new(&mut parent_buf, self.params);
            parent.fuse_leaves(right_index, &mut left_buf, &mut right_buf)
        };
        self.collection.write(&parent_buf)?;
        self.collection.write(&left_buf)?;
        match outcome {
            FuseOutcome::Shared { .. } => {
                return self.collection.write(&right_buf);
            }
            FuseOutcome::Merged => {
                trace!(block = right_handle.id(), "leaf merged into left sibling");
                self.collection.free_buffer(&right_buf)?;
            }
        }
        path.pop();

        // Walk upward while merges leave branch nodes underfull.
        let mut node_buf = parent_buf;
        loop {
            let (degree, underfull) = {
                let node = BranchView::<T>::new(&mut node_buf, self.params);
                (node.degree(), node.underfull())
            };

            let (parent_handle, child_index) = match path.current() {
                None => {
                    if degree == 1 {
                        // Promote the lone child to root.
                        let new_root = {
                            let node = BranchView::<T>::new(&mut node_buf, self.params);
                            node.child(0)
                        };
                        self.collection.free(node_buf.handle())?;
                        self.root = new_root;
                        self.height -= 1;
                        trace!(
                            root = self.root.id(),
                            height = self.height,
                            "tree shrank"
                        );
                    }
                    return Ok(());
                }
                Some(step) => step,
            };

            if !underfull {
                return Ok(());
            }

            let right_index = child_index.max(1);
            let mut parent_buf = self.collection.read(parent_handle)?;
            let (left_handle, right_handle) = {
                let parent = BranchView::<T>::new(&mut parent_buf, self.params);
                (parent.child(right_index - 1), parent.child(right_index))
            };
            let mut left_buf = self.collection.read(left_handle)?;
            let mut right_buf = self.collection.read(right_handle)?;
            let outcome = {
                let mut parent = BranchView::<T>::new(&mut parent_buf, self.params);
                parent.fuse(right_index, &mut left_buf, &mut right_buf)
            };
            self.collection.write(&parent_buf)?;
            self.collection.write(&left_buf)?;
            match outcome {
                FuseOutcome::Shared { .. } => {
                    return self.collection.write(&right_buf);
                }
                FuseOutcome::Merged => {
                    trace!(
                        block = right_handle.id(),
                        "branch merged into left sibling"
                    );
                    self.collection.free_buffer(&right_buf)?;
                }
            }
            path.pop();
            node_buf = parent_buf;
        }
    }

    /// Number of values equal to `key` (0 or 1).
    pub fn count(&self, key: &T::Key) -> Result<usize> {
        self.require_open()?;
        if self.root.is_null() {
            return Ok(0);
        }
        let mut leaf_buf = self.leaf_for(key)?;
        let leaf = LeafView::<T>::new(&mut leaf_buf, self.params);
        Ok(leaf.count(key))
    }

    /// Returns the value equal to `key`, if present.
    pub fn try_find(&self, key: &T::Key) -> Result<Option<T::Value>> {
        self.require_open()?;
        if self.root.is_null() {
            return Ok(None);
        }
        let mut leaf_buf = self.leaf_for(key)?;
        let leaf = LeafView::<T>::new(&mut leaf_buf, self.params);
        Ok(leaf.index_of(key).map(|i| leaf.value(i)))
    }

    /// Returns the value equal to `key`, failing with `KeyNotFound` when
    /// absent.
    pub fn find(&self, key: &T::Key) -> Result<T::Value> {
        self.try_find(key)?.ok_or(StrataError::KeyNotFound)
    }

    /// Feeds every value to `sink` in key order.
    ///
    /// Leaves are unordered in-block, so each is sorted as it is emitted.
    pub fn in_order_dump<F: FnMut(&T::Value)>(&self, mut sink: F) -> Result<()> {
        self.require_open()?;
        if self.root.is_null() {
            return Ok(());
        }
        self.dump_subtree(self.root, self.height, &mut sink)
    }

    fn dump_subtree<F: FnMut(&T::Value)>(
        &self,
        handle: BlockHandle,
        leaf_distance: usize,
        sink: &mut F,
    ) -> Result<()> {
        let mut buf = self.collection.read(handle)?;
        if leaf_distance == 0 {
            let leaf = LeafView::<T>::new(&mut buf, self.params);
            let mut values = leaf.values();
            values.sort_by(|a, b| T::compare(&T::key_of_value(a), &T::key_of_value(b)));
            for value in &values {
                sink(value);
            }
            return Ok(());
        }

        let children: Vec<BlockHandle> = {
            let node = BranchView::<T>::new(&mut buf, self.params);
            (0..node.degree()).map(|i| node.child(i)).collect()
        };
        for child in children {
            self.dump_subtree(child, leaf_distance - 1, sink)?;
        }
        Ok(())
    }

    /// Walks the whole tree checking the structural invariants: uniform
    /// leaf depth, occupancy bounds, key ordering, handle distinctness,
    /// and bitmap coherence. Intended for tests and debugging.
    pub fn check_invariants(&self) -> Result<()> {
        self.require_open()?;
        if self.root.is_null() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        self.check_subtree(self.root, self.height, true, None, None, &mut seen)
    }

    fn check_subtree(
        &self,
        handle: BlockHandle,
        leaf_distance: usize,
        is_root: bool,
        lower: Option<T::Key>,
        upper: Option<T::Key>,
        seen: &mut HashSet<u64>,
    ) -> Result<()> {
        if handle.is_null() {
            return Err(violation(format!(
                "null child at distance {leaf_distance} above the leaves"
            )));
        }
        if !self.collection.is_allocated(handle) {
            return Err(violation(format!("block {handle} is reachable but not allocated")));
        }
        if !seen.insert(handle.id()) {
            return Err(violation(format!("block {handle} is reachable twice")));
        }

        let mut buf = self.collection.read(handle)?;

        if leaf_distance == 0 {
            let leaf = LeafView::<T>::new(&mut buf, self.params);
            let degree = leaf.degree();
            if degree > self.params.leaf_max {
                return Err(violation(format!("leaf {handle} overfull: {degree}")));
            }
            if !is_root && degree < self.params.leaf_min {
                return Err(violation(format!("leaf {handle} underfull: {degree}")));
            }
            for i in 0..degree {
                let k = T::key_of_value(&leaf.value(i));
                if let Some(lo) = &lower {
                    if T::compare(&k, lo) == Ordering::Less {
                        return Err(violation(format!("leaf {handle} key below subtree bound")));
                    }
                }
                if let Some(hi) = &upper {
                    if T::compare(&k, hi) != Ordering::Less {
                        return Err(violation(format!("leaf {handle} key above subtree bound")));
                    }
                }
            }
            return Ok(());
        }

        let (degree, keys, children) = {
            let node = BranchView::<T>::new(&mut buf, self.params);
            let keys: Vec<T::Key> = (0..node.keys()).map(|i| node.key(i)).collect();
            let children: Vec<BlockHandle> =
                (0..node.degree()).map(|i| node.child(i)).collect();
            (node.degree(), keys, children)
        };

        if degree > self.params.node_max {
            return Err(violation(format!("branch {handle} overfull: {degree}")));
        }
        let min = if is_root { 2 } else { self.params.node_min };
        if degree < min {
            return Err(violation(format!("branch {handle} underfull: {degree}")));
        }
        for w in keys.windows(2) {
            if T::compare(&w[0], &w[1]) == Ordering::Greater {
                return Err(violation(format!("branch {handle} keys out of order")));
            }
        }

        for (i, child) in children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { Some(keys[i - 1]) };
            let child_upper = if i == degree - 1 { upper } else { Some(keys[i]) };
            self.check_subtree(*child, leaf_distance - 1, false, child_lower, child_upper, seen)?;
        }
        Ok(())
    }
}

fn violation(message: String) -> StrataError {
    StrataError::InvariantViolated(message)
}
