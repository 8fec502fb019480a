//! Branch (internal) node view over a block buffer.
//!
//! Block layout:
//! ```text
//! +-------------------+ 0
//! | NodeHeader (16)   |   degree = number of children
//! +-------------------+ 16
//! | Child handles     |   8 bytes each, node_max slots
//! +-------------------+ 16 + node_max * 8
//! | Separator keys    |   KEY_LEN bytes each, node_max - 1 slots,
//! +-------------------+   first `degree - 1` live
//! ```
//!
//! For children `c0 .. c(d-1)` and keys `k0 .. k(d-2)`: every key reachable
//! through `ci` is `< ki` and `>= k(i-1)`.

use crate::leaf::LeafView;
use crate::traits::TreeTraits;
use crate::types::FuseOutcome;
use std::cmp::Ordering;
use std::marker::PhantomData;
use strata_common::{BlockBuffer, BlockHandle, NodeHeader, TreeParameters, BLOCK_SIZE};

/// Size of a child handle slot in bytes.
const CHILD_LEN: usize = 8;

/// Borrowed view interpreting a block buffer as a branch node.
pub struct BranchView<'a, T: TreeTraits> {
    buf: &'a mut BlockBuffer,
    params: TreeParameters,
    _marker: PhantomData<T>,
}

impl<'a, T: TreeTraits> BranchView<'a, T> {
    /// Offset of the first child slot.
    const CHILDREN_START: usize = NodeHeader::SIZE;

    /// Binds a view to a buffer.
    pub fn new(buf: &'a mut BlockBuffer, params: TreeParameters) -> Self {
        Self {
            buf,
            params,
            _marker: PhantomData,
        }
    }

    /// Largest number of children a branch block can hold.
    pub fn max_fanout() -> usize {
        // One more child slot than key slots.
        (BLOCK_SIZE - NodeHeader::SIZE - CHILD_LEN) / (CHILD_LEN + T::KEY_LEN)
    }

    fn keys_start(&self) -> usize {
        Self::CHILDREN_START + self.params.node_max * CHILD_LEN
    }

    /// Number of children.
    pub fn degree(&self) -> usize {
        NodeHeader::read_degree(self.buf.as_bytes()) as usize
    }

    fn set_degree(&mut self, degree: usize) {
        NodeHeader::write_degree(self.buf.as_bytes_mut(), degree as u64);
    }

    /// Number of live separator keys (`degree - 1`).
    pub fn keys(&self) -> usize {
        self.degree() - 1
    }

    pub fn full(&self) -> bool {
        self.degree() == self.params.node_max
    }

    pub fn underfull(&self) -> bool {
        self.degree() < self.params.node_min
    }

    pub fn empty(&self) -> bool {
        self.degree() == 0
    }

    /// Resets the node to zero children.
    pub fn clear(&mut self) {
        self.set_degree(0);
    }

    /// Decodes separator key `i`.
    pub fn key(&self, i: usize) -> T::Key {
        debug_assert!(i < self.keys());
        let off = self.keys_start() + i * T::KEY_LEN;
        T::decode_key(&self.buf.as_bytes()[off..off + T::KEY_LEN])
    }

    fn set_key(&mut self, i: usize, key: &T::Key) {
        let off = self.keys_start() + i * T::KEY_LEN;
        T::encode_key(key, &mut self.buf.as_bytes_mut()[off..off + T::KEY_LEN]);
    }

    /// Returns child handle `i`.
    pub fn child(&self, i: usize) -> BlockHandle {
        debug_assert!(i < self.degree());
        let off = Self::CHILDREN_START + i * CHILD_LEN;
        let bytes = &self.buf.as_bytes()[off..off + CHILD_LEN];
        BlockHandle::new(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn set_child(&mut self, i: usize, child: BlockHandle) {
        let off = Self::CHILDREN_START + i * CHILD_LEN;
        self.buf.as_bytes_mut()[off..off + CHILD_LEN].copy_from_slice(&child.id().to_le_bytes());
    }

    /// Index of the child to descend into for `key`: the first separator
    /// greater than `key`, or the last child when none is.
    pub fn find_child(&self, key: &T::Key) -> usize {
        let keys = self.keys();
        for i in 0..keys {
            if T::compare(key, &self.key(i)) == Ordering::Less {
                return i;
            }
        }
        keys
    }

    /// Initializes an empty node as a root with one key and two children.
    pub fn new_root(&mut self, key: &T::Key, left: BlockHandle, right: BlockHandle) {
        debug_assert!(self.empty(), "new_root on non-empty node");
        self.set_degree(2);
        self.set_key(0, key);
        self.set_child(0, left);
        self.set_child(1, right);
    }

    /// Appends the leftmost child of a node under construction.
    pub fn push_first_child(&mut self, child: BlockHandle) {
        debug_assert!(self.empty(), "push_first_child on non-empty node");
        self.set_child(0, child);
        self.set_degree(1);
    }

    /// Appends a further `(separator, child)` pair to a node under
    /// construction.
    pub fn push_child(&mut self, key: &T::Key, child: BlockHandle) {
        debug_assert!(!self.full(), "push_child on full node");
        let degree = self.degree();
        self.set_key(degree - 1, key);
        self.set_child(degree, child);
        self.set_degree(degree + 1);
    }

    /// Inserts separator `key` at key position `i`, replacing child `i`
    /// with `left` and inserting `right` after it. Pre-condition: `!full()`.
    pub fn insert(&mut self, i: usize, key: &T::Key, left: BlockHandle, right: BlockHandle) {
        debug_assert!(!self.full(), "insert into full branch node");
        let keys = self.keys();

        self.set_child(i, left);
        let mut carry_child = right;
        let mut carry_key = *key;
        for j in i..keys {
            let next_child = self.child(j + 1);
            let next_key = self.key(j);
            self.set_child(j + 1, carry_child);
            self.set_key(j, &carry_key);
            carry_child = next_child;
            carry_key = next_key;
        }
        self.set_child(keys + 1, carry_child);
        self.set_key(keys, &carry_key);
        self.set_degree(self.degree() + 1);
    }

    /// Splits a full node while performing the insert of
    /// `(key, left, right)` at key position `i`, writing the halves into
    /// `left_buf` and `right_buf` and emptying this node.
    ///
    /// The `node_max + 1` post-insert children are divided evenly, so both
    /// halves hold at least `node_min` children for every parameter set
    /// accepted by validation. The median key is returned and stored in
    /// neither half. Pre-condition: `full()`.
    pub fn split_insert(
        &mut self,
        i: usize,
        key: &T::Key,
        left_child: BlockHandle,
        right_child: BlockHandle,
        left_buf: &mut BlockBuffer,
        right_buf: &mut BlockBuffer,
    ) -> T::Key {
        debug_assert!(self.full(), "split_insert on non-full branch node");

        let mut all_keys: Vec<T::Key> = Vec::with_capacity(self.params.node_max);
        let mut all_children: Vec<BlockHandle> = Vec::with_capacity(self.params.node_max + 1);
        for j in 0..i {
            all_keys.push(self.key(j));
            all_children.push(self.child(j));
        }
        all_keys.push(*key);
        all_children.push(left_child);
        all_children.push(right_child);
        for j in i..self.keys() {
            all_keys.push(self.key(j));
        }
        for j in i + 1..self.degree() {
            all_children.push(self.child(j));
        }

        let left_n = (self.params.node_max + 2) / 2;
        let mid = all_keys[left_n - 1];

        let mut left = BranchView::<T>::new(left_buf, self.params);
        left.clear();
        left.write_halves(&all_keys[..left_n - 1], &all_children[..left_n]);

        let mut right = BranchView::<T>::new(right_buf, self.params);
        right.clear();
        right.write_halves(&all_keys[left_n..], &all_children[left_n..]);

        self.set_degree(0);
        mid
    }

    fn write_halves(&mut self, keys: &[T::Key], children: &[BlockHandle]) {
        debug_assert_eq!(keys.len() + 1, children.len());
        for (j, child) in children.iter().enumerate() {
            self.set_child(j, *child);
        }
        for (j, key) in keys.iter().enumerate() {
            self.set_key(j, key);
        }
        self.set_degree(children.len());
    }

    /// Fuses the two leaf children around separator `right_index - 1`,
    /// updating this node's keys and children accordingly.
    pub fn fuse_leaves(
        &mut self,
        right_index: usize,
        left_buf: &mut BlockBuffer,
        right_buf: &mut BlockBuffer,
    ) -> FuseOutcome<T::Key> {
        let outcome = {
            let mut left = LeafView::<T>::new(left_buf, self.params);
            let mut right = LeafView::<T>::new(right_buf, self.params);
            left.fuse_with(&mut right)
        };
        match outcome {
            FuseOutcome::Merged => {
                self.remove_separator(right_index);
                FuseOutcome::Merged
            }
            FuseOutcome::Shared { pivot } => {
                self.set_key(right_index - 1, &pivot);
                FuseOutcome::Shared { pivot }
            }
        }
    }

    /// Fuses the two branch children around separator `right_index - 1`.
    ///
    /// The concatenation `left.keys + separator + right.keys` with all
    /// children merges into the left child when it fits; otherwise it is
    /// split at half the children, with the key before the split point
    /// promoted back into this node as the new separator.
    pub fn fuse(
        &mut self,
        right_index: usize,
        left_buf: &mut BlockBuffer,
        right_buf: &mut BlockBuffer,
    ) -> FuseOutcome<T::Key> {
        let mut left = BranchView::<T>::new(left_buf, self.params);
        let mut right = BranchView::<T>::new(right_buf, self.params);

        let mut all_keys: Vec<T::Key> =
            Vec::with_capacity(left.keys() + 1 + right.keys());
        let mut all_children: Vec<BlockHandle> =
            Vec::with_capacity(left.degree() + right.degree());

        for j in 0..left.keys() {
            all_keys.push(left.key(j));
        }
        for j in 0..left.degree() {
            all_children.push(left.child(j));
        }
        all_keys.push(self.key(right_index - 1));
        for j in 0..right.keys() {
            all_keys.push(right.key(j));
        }
        for j in 0..right.degree() {
            all_children.push(right.child(j));
        }

        if all_children.len() <= self.params.node_max {
            left.write_halves(&all_keys, &all_children);
            self.remove_separator(right_index);
            FuseOutcome::Merged
        } else {
            let half = all_children.len() / 2;
            left.write_halves(&all_keys[..half - 1], &all_children[..half]);
            right.write_halves(&all_keys[half..], &all_children[half..]);
            let pivot = all_keys[half - 1];
            self.set_key(right_index - 1, &pivot);
            FuseOutcome::Shared { pivot }
        }
    }

    /// Drops separator `right_index - 1` and child `right_index` after a
    /// merge of the two children around them.
    fn remove_separator(&mut self, right_index: usize) {
        let keys = self.keys();
        for j in right_index..keys {
            let k = self.key(j);
            self.set_key(j - 1, &k);
        }
        for j in right_index + 1..self.degree() {
            let c = self.child(j);
            self.set_child(j - 1, c);
        }
        self.set_degree(self.degree() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::U64Traits;

    fn params() -> TreeParameters {
        TreeParameters::new(2, 4, 2, 4).unwrap()
    }

    fn h(id: u64) -> BlockHandle {
        BlockHandle::new(id)
    }

    /// Builds a branch node with the given keys and children 10, 20, ...
    fn branch_buffer(keys: &[u64]) -> BlockBuffer {
        let mut buf = BlockBuffer::zeroed(h(1));
        let mut node = BranchView::<U64Traits>::new(&mut buf, params());
        node.clear();
        node.push_first_child(h(10));
        for (i, k) in keys.iter().enumerate() {
            node.push_child(k, h(20 + 10 * i as u64));
        }
        buf
    }

    #[test]
    fn test_max_fanout() {
        assert_eq!(
            BranchView::<U64Traits>::max_fanout(),
            (BLOCK_SIZE - 16 - 8) / 16
        );
    }

    #[test]
    fn test_push_builds_node() {
        let mut buf = branch_buffer(&[5, 9]);
        let node = BranchView::<U64Traits>::new(&mut buf, params());

        assert_eq!(node.degree(), 3);
        assert_eq!(node.keys(), 2);
        assert_eq!(node.key(0), 5);
        assert_eq!(node.key(1), 9);
        assert_eq!(node.child(0), h(10));
        assert_eq!(node.child(1), h(20));
        assert_eq!(node.child(2), h(30));
    }

    #[test]
    fn test_new_root() {
        let mut buf = BlockBuffer::zeroed(h(1));
        let mut node = BranchView::<U64Traits>::new(&mut buf, params());
        node.clear();
        node.new_root(&42, h(2), h(3));

        assert_eq!(node.degree(), 2);
        assert_eq!(node.key(0), 42);
        assert_eq!(node.child(0), h(2));
        assert_eq!(node.child(1), h(3));
    }

    #[test]
    fn test_find_child() {
        let mut buf = branch_buffer(&[5, 9]);
        let node = BranchView::<U64Traits>::new(&mut buf, params());

        assert_eq!(node.find_child(&3), 0);
        assert_eq!(node.find_child(&5), 1); // equal keys descend right
        assert_eq!(node.find_child(&7), 1);
        assert_eq!(node.find_child(&9), 2);
        assert_eq!(node.find_child(&100), 2);
    }

    #[test]
    fn test_insert_shifts_entries() {
        let mut buf = branch_buffer(&[5, 9]);
        let mut node = BranchView::<U64Traits>::new(&mut buf, params());

        // Child 1 (between 5 and 9) split into handles 77/88 around key 7.
        node.insert(1, &7, h(77), h(88));

        assert_eq!(node.degree(), 4);
        assert_eq!(node.key(0), 5);
        assert_eq!(node.key(1), 7);
        assert_eq!(node.key(2), 9);
        assert_eq!(node.child(0), h(10));
        assert_eq!(node.child(1), h(77));
        assert_eq!(node.child(2), h(88));
        assert_eq!(node.child(3), h(30));
    }

    #[test]
    fn test_insert_at_end() {
        let mut buf = branch_buffer(&[5]);
        let mut node = BranchView::<U64Traits>::new(&mut buf, params());

        node.insert(1, &9, h(77), h(88));
        assert_eq!(node.degree(), 3);
        assert_eq!(node.key(1), 9);
        assert_eq!(node.child(1), h(77));
        assert_eq!(node.child(2), h(88));
    }

    #[test]
    fn test_split_insert_promotes_median() {
        // Full node: children 10,20,30,40 and keys 5,9,13.
        let mut buf = branch_buffer(&[5, 9, 13]);
        let mut left_buf = BlockBuffer::zeroed(h(101));
        let mut right_buf = BlockBuffer::zeroed(h(102));

        // Split child 1 into 77/88 around key 7.
        let mid = {
            let mut node = BranchView::<U64Traits>::new(&mut buf, params());
            node.split_insert(1, &7, h(77), h(88), &mut left_buf, &mut right_buf)
        };

        // Post-insert sequence: children 10,77,88,30,40; keys 5,7,9,13.
        // Even split: 3 children left, 2 right, median key 9.
        assert_eq!(mid, 9);

        let node = BranchView::<U64Traits>::new(&mut buf, params());
        assert_eq!(node.degree(), 0);

        let left = BranchView::<U64Traits>::new(&mut left_buf, params());
        assert_eq!(left.degree(), 3);
        assert_eq!(left.key(0), 5);
        assert_eq!(left.key(1), 7);
        assert_eq!(left.child(0), h(10));
        assert_eq!(left.child(1), h(77));
        assert_eq!(left.child(2), h(88));

        let right = BranchView::<U64Traits>::new(&mut right_buf, params());
        assert_eq!(right.degree(), 2);
        assert_eq!(right.key(0), 13);
        assert_eq!(right.child(0), h(30));
        assert_eq!(right.child(1), h(40));
    }

    #[test]
    fn test_split_insert_smallest_legal_node() {
        let params = TreeParameters::new(2, 3, 2, 3).unwrap();
        let mut buf = BlockBuffer::zeroed(h(1));
        {
            let mut node = BranchView::<U64Traits>::new(&mut buf, params);
            node.clear();
            node.push_first_child(h(10));
            node.push_child(&5, h(20));
            node.push_child(&9, h(30));
        }
        let mut left_buf = BlockBuffer::zeroed(h(101));
        let mut right_buf = BlockBuffer::zeroed(h(102));
        let mid = {
            let mut node = BranchView::<U64Traits>::new(&mut buf, params);
            node.split_insert(2, &13, h(77), h(88), &mut left_buf, &mut right_buf)
        };

        // Both halves must satisfy node_min = 2.
        assert_eq!(mid, 9);
        let left = BranchView::<U64Traits>::new(&mut left_buf, params);
        let right = BranchView::<U64Traits>::new(&mut right_buf, params);
        assert_eq!(left.degree(), 2);
        assert_eq!(right.degree(), 2);
        assert_eq!(right.key(0), 13);
        assert_eq!(right.child(0), h(77));
        assert_eq!(right.child(1), h(88));
    }

    #[test]
    fn test_fuse_merge() {
        let params = params();
        // Parent with three children; fuse the pair around separator 9.
        let mut parent_buf = branch_buffer(&[5, 9]);

        let mut left_buf = BlockBuffer::zeroed(h(20));
        {
            let mut left = BranchView::<U64Traits>::new(&mut left_buf, params);
            left.clear();
            left.push_first_child(h(200));
            left.push_child(&7, h(201));
        }
        let mut right_buf = BlockBuffer::zeroed(h(30));
        {
            let mut right = BranchView::<U64Traits>::new(&mut right_buf, params);
            right.clear();
            right.push_first_child(h(300));
            right.push_child(&11, h(301));
        }

        let outcome = {
            let mut parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
            parent.fuse(2, &mut left_buf, &mut right_buf)
        };
        assert_eq!(outcome, FuseOutcome::Merged);

        let parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
        assert_eq!(parent.degree(), 2);
        assert_eq!(parent.keys(), 1);
        assert_eq!(parent.key(0), 5);
        assert_eq!(parent.child(1), h(20));

        // Left child absorbed the separator and the right child.
        let left = BranchView::<U64Traits>::new(&mut left_buf, params);
        assert_eq!(left.degree(), 4);
        assert_eq!(left.key(0), 7);
        assert_eq!(left.key(1), 9);
        assert_eq!(left.key(2), 11);
        assert_eq!(left.child(2), h(300));
    }

    #[test]
    fn test_fuse_share() {
        let params = params();
        let mut parent_buf = branch_buffer(&[5, 9]);

        // Left has 2 children, right has 4: total 6 > node_max, so share.
        let mut left_buf = BlockBuffer::zeroed(h(20));
        {
            let mut left = BranchView::<U64Traits>::new(&mut left_buf, params);
            left.clear();
            left.push_first_child(h(200));
            left.push_child(&6, h(201));
        }
        let mut right_buf = BlockBuffer::zeroed(h(30));
        {
            let mut right = BranchView::<U64Traits>::new(&mut right_buf, params);
            right.clear();
            right.push_first_child(h(300));
            right.push_child(&11, h(301));
            right.push_child(&13, h(302));
            right.push_child(&15, h(303));
        }

        let outcome = {
            let mut parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
            parent.fuse(2, &mut left_buf, &mut right_buf)
        };

        // Concatenation: keys 6,9,11,13,15 and six children; half = 3.
        match outcome {
            FuseOutcome::Shared { pivot } => assert_eq!(pivot, 11),
            FuseOutcome::Merged => panic!("expected share"),
        }

        let parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
        assert_eq!(parent.degree(), 3);
        assert_eq!(parent.key(1), 11);

        let left = BranchView::<U64Traits>::new(&mut left_buf, params);
        assert_eq!(left.degree(), 3);
        assert_eq!(left.key(0), 6);
        assert_eq!(left.key(1), 9);
        assert_eq!(left.child(2), h(300));

        let right = BranchView::<U64Traits>::new(&mut right_buf, params);
        assert_eq!(right.degree(), 3);
        assert_eq!(right.key(0), 13);
        assert_eq!(right.key(1), 15);
        assert_eq!(right.child(0), h(301));
    }

    #[test]
    fn test_fuse_leaves_merge_updates_parent() {
        use crate::leaf::LeafView;

        let params = params();
        let mut parent_buf = branch_buffer(&[5, 9]);

        let mut left_buf = BlockBuffer::zeroed(h(20));
        {
            let mut leaf = LeafView::<U64Traits>::new(&mut left_buf, params);
            leaf.clear();
            leaf.insert(&5);
        }
        let mut right_buf = BlockBuffer::zeroed(h(30));
        {
            let mut leaf = LeafView::<U64Traits>::new(&mut right_buf, params);
            leaf.clear();
            leaf.insert(&9);
            leaf.insert(&10);
        }

        let outcome = {
            let mut parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
            parent.fuse_leaves(2, &mut left_buf, &mut right_buf)
        };
        assert_eq!(outcome, FuseOutcome::Merged);

        let parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
        assert_eq!(parent.degree(), 2);
        assert_eq!(parent.key(0), 5);

        let leaf = LeafView::<U64Traits>::new(&mut left_buf, params);
        assert_eq!(leaf.degree(), 3);
    }

    #[test]
    fn test_fuse_leaves_share_updates_separator() {
        use crate::leaf::LeafView;

        let params = params();
        let mut parent_buf = branch_buffer(&[5, 9]);

        let mut left_buf = BlockBuffer::zeroed(h(20));
        {
            let mut leaf = LeafView::<U64Traits>::new(&mut left_buf, params);
            leaf.clear();
            leaf.insert(&5);
        }
        let mut right_buf = BlockBuffer::zeroed(h(30));
        {
            let mut leaf = LeafView::<U64Traits>::new(&mut right_buf, params);
            leaf.clear();
            for v in [9, 10, 11, 12] {
                leaf.insert(&v);
            }
        }

        let outcome = {
            let mut parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
            parent.fuse_leaves(2, &mut left_buf, &mut right_buf)
        };

        let pivot = match outcome {
            FuseOutcome::Shared { pivot } => pivot,
            FuseOutcome::Merged => panic!("expected share"),
        };
        let parent = BranchView::<U64Traits>::new(&mut parent_buf, params);
        assert_eq!(parent.degree(), 3);
        assert_eq!(parent.key(1), pivot);
    }
}
