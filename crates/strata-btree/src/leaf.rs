//! Leaf node view over a block buffer.
//!
//! Block layout:
//! ```text
//! +-------------------+ 0
//! | NodeHeader (16)   |   degree = number of live values
//! +-------------------+ 16
//! | Value slots       |   VALUE_LEN bytes each, leaf_max slots,
//! | (unordered)       |   first `degree` live
//! +-------------------+
//! ```
//!
//! Values are kept unordered within the block: inserting into a non-full
//! leaf is a single append, and the in-order dump sorts each leaf as it is
//! emitted. No other code relies on in-block order.

use crate::traits::TreeTraits;
use crate::types::FuseOutcome;
use std::cmp::Ordering;
use std::marker::PhantomData;
use strata_common::{BlockBuffer, NodeHeader, TreeParameters, BLOCK_SIZE};

/// Borrowed view interpreting a block buffer as a leaf.
pub struct LeafView<'a, T: TreeTraits> {
    buf: &'a mut BlockBuffer,
    params: TreeParameters,
    _marker: PhantomData<T>,
}

impl<'a, T: TreeTraits> LeafView<'a, T> {
    /// Offset of the first value slot.
    const VALUES_START: usize = NodeHeader::SIZE;

    /// Binds a view to a buffer.
    pub fn new(buf: &'a mut BlockBuffer, params: TreeParameters) -> Self {
        Self {
            buf,
            params,
            _marker: PhantomData,
        }
    }

    /// Largest number of values a leaf block can hold.
    pub fn max_fanout() -> usize {
        (BLOCK_SIZE - NodeHeader::SIZE) / T::VALUE_LEN
    }

    /// Number of live values.
    pub fn degree(&self) -> usize {
        NodeHeader::read_degree(self.buf.as_bytes()) as usize
    }

    fn set_degree(&mut self, degree: usize) {
        NodeHeader::write_degree(self.buf.as_bytes_mut(), degree as u64);
    }

    pub fn full(&self) -> bool {
        self.degree() == self.params.leaf_max
    }

    pub fn underfull(&self) -> bool {
        self.degree() < self.params.leaf_min
    }

    pub fn empty(&self) -> bool {
        self.degree() == 0
    }

    /// Resets the leaf to zero values.
    pub fn clear(&mut self) {
        self.set_degree(0);
    }

    /// Decodes the value in slot `i`.
    pub fn value(&self, i: usize) -> T::Value {
        debug_assert!(i < self.degree());
        let off = Self::VALUES_START + i * T::VALUE_LEN;
        T::decode_value(&self.buf.as_bytes()[off..off + T::VALUE_LEN])
    }

    fn set_value(&mut self, i: usize, value: &T::Value) {
        let off = Self::VALUES_START + i * T::VALUE_LEN;
        T::encode_value(value, &mut self.buf.as_bytes_mut()[off..off + T::VALUE_LEN]);
    }

    /// Decodes all live values.
    pub fn values(&self) -> Vec<T::Value> {
        (0..self.degree()).map(|i| self.value(i)).collect()
    }

    /// Slot of the first value whose key equals `key`, if any.
    pub fn index_of(&self, key: &T::Key) -> Option<usize> {
        (0..self.degree())
            .find(|&i| T::compare(&T::key_of_value(&self.value(i)), key) == Ordering::Equal)
    }

    /// Number of values equal to `key` (0 or 1).
    pub fn count(&self, key: &T::Key) -> usize {
        usize::from(self.index_of(key).is_some())
    }

    /// Appends a value. Pre-condition: `!full()`.
    pub fn insert(&mut self, value: &T::Value) {
        debug_assert!(!self.full(), "insert into full leaf");
        let degree = self.degree();
        self.set_value(degree, value);
        self.set_degree(degree + 1);
    }

    /// Splits a full leaf while inserting `value`, filling `right_buf` with
    /// the upper half. Returns the smallest key now in the right leaf.
    ///
    /// The `leaf_max + 1` values are divided evenly, so both halves hold at
    /// least `leaf_min` values for every parameter set accepted by
    /// validation. Pre-condition: `full()`.
    pub fn split_insert(&mut self, value: &T::Value, right_buf: &mut BlockBuffer) -> T::Key {
        debug_assert!(self.full(), "split_insert on non-full leaf");

        let mut all = self.values();
        all.push(*value);

        let left_n = (self.params.leaf_max + 2) / 2;
        all.select_nth_unstable_by(left_n, |a, b| {
            T::compare(&T::key_of_value(a), &T::key_of_value(b))
        });

        self.set_degree(left_n);
        for (i, v) in all[..left_n].iter().enumerate() {
            self.set_value(i, v);
        }

        let mut right = LeafView::<T>::new(right_buf, self.params);
        right.set_degree(all.len() - left_n);
        for (i, v) in all[left_n..].iter().enumerate() {
            right.set_value(i, v);
        }

        T::key_of_value(&all[left_n])
    }

    /// Removes the value equal to `key`, swapping the last slot into its
    /// place. Fails when the key is absent.
    pub fn erase(&mut self, key: &T::Key) -> strata_common::Result<()> {
        let i = self
            .index_of(key)
            .ok_or(strata_common::StrataError::KeyNotFound)?;
        let degree = self.degree();
        let last = self.value(degree - 1);
        self.set_value(i, &last);
        self.set_degree(degree - 1);
        Ok(())
    }

    /// Fuses this leaf with its right sibling.
    ///
    /// Merges when everything fits in one leaf; otherwise redistributes the
    /// values evenly and reports the new separator.
    pub fn fuse_with(&mut self, right: &mut LeafView<'_, T>) -> FuseOutcome<T::Key> {
        let left_degree = self.degree();
        let right_degree = right.degree();

        if left_degree + right_degree <= self.params.leaf_max {
            for i in 0..right_degree {
                let v = right.value(i);
                self.set_value(left_degree + i, &v);
            }
            self.set_degree(left_degree + right_degree);
            return FuseOutcome::Merged;
        }

        let mut all = self.values();
        all.extend(right.values());
        let mid = all.len() / 2;
        all.select_nth_unstable_by(mid, |a, b| {
            T::compare(&T::key_of_value(a), &T::key_of_value(b))
        });

        self.set_degree(mid);
        for (i, v) in all[..mid].iter().enumerate() {
            self.set_value(i, v);
        }
        right.set_degree(all.len() - mid);
        for (i, v) in all[mid..].iter().enumerate() {
            right.set_value(i, v);
        }

        FuseOutcome::Shared {
            pivot: T::key_of_value(&all[mid]),
        }
    }
}
