//! In-memory allocation bitmap persisted in block 0.
//!
//! One bit per potential block in the collection, packed into machine
//! words: `1` = allocated, `0` = free. Bit 0 is pinned to 1 because block 0
//! stores the bitmap itself. A cursor remembers the first word that may
//! still contain a free bit, so allocation is amortized constant time and
//! prefers low-numbered blocks, keeping the file compact.

use strata_common::{BlockBuffer, BLOCK_SIZE};

/// Number of 64-bit words in the bitmap.
const WORDS: usize = BLOCK_SIZE / 8;

/// Free-block bitmap for one collection.
pub struct AllocationBitmap {
    /// Bitmap words; bit `i % 64` of word `i / 64` covers block `i`.
    words: Box<[u64; WORDS]>,
    /// Index of the first word that may contain a zero bit.
    cursor: usize,
}

impl AllocationBitmap {
    /// Creates a fresh bitmap with only block 0 allocated.
    pub fn new() -> Self {
        let mut words = Box::new([0u64; WORDS]);
        words[0] = 1;
        Self { words, cursor: 0 }
    }

    /// Restores a bitmap from the contents of block 0.
    ///
    /// Words are stored in native byte order; bit 0 is forced back on in
    /// case the block was tampered with.
    pub fn from_block(block: &BlockBuffer) -> Self {
        let bytes = block.as_bytes();
        let mut words = Box::new([0u64; WORDS]);
        for (i, word) in words.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *word = u64::from_ne_bytes(chunk);
        }
        words[0] |= 1;
        Self { words, cursor: 0 }
    }

    /// Serializes the bitmap into a block buffer.
    pub fn write_to(&self, block: &mut BlockBuffer) {
        let bytes = block.as_bytes_mut();
        for (i, word) in self.words.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&word.to_ne_bytes());
        }
    }

    /// Returns true if the bit for `id` is set.
    pub fn is_allocated(&self, id: u64) -> bool {
        let id = id as usize;
        self.words[id / 64] & (1 << (id % 64)) != 0
    }

    /// Claims the lowest free block at or after the cursor.
    ///
    /// Returns `None` when every bit is set.
    pub fn allocate(&mut self) -> Option<u64> {
        while self.cursor < WORDS {
            let word = self.words[self.cursor];
            if word != u64::MAX {
                let bit = word.trailing_ones() as usize;
                self.words[self.cursor] |= 1 << bit;
                let id = (self.cursor * 64 + bit) as u64;
                if self.words[self.cursor] == u64::MAX {
                    self.cursor += 1;
                }
                return Some(id);
            }
            self.cursor += 1;
        }
        None
    }

    /// Clears the bit for `id` and rewinds the cursor if `id` is earlier.
    ///
    /// The caller is responsible for never freeing block 0.
    pub fn free(&mut self, id: u64) {
        let id = id as usize;
        let word = id / 64;
        self.words[word] &= !(1 << (id % 64));
        if word < self.cursor {
            self.cursor = word;
        }
    }

    /// Number of allocated blocks, counting the bitmap block itself.
    pub fn allocated_count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

impl Default for AllocationBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{BlockHandle, MAX_BLOCKS};

    #[test]
    fn test_fresh_bitmap_reserves_block_zero() {
        let bitmap = AllocationBitmap::new();
        assert!(bitmap.is_allocated(0));
        assert_eq!(bitmap.allocated_count(), 1);
    }

    #[test]
    fn test_allocate_skips_block_zero() {
        let mut bitmap = AllocationBitmap::new();
        assert_eq!(bitmap.allocate(), Some(1));
        assert_eq!(bitmap.allocate(), Some(2));
        assert_eq!(bitmap.allocate(), Some(3));
    }

    #[test]
    fn test_free_then_reallocate_lowest_first() {
        let mut bitmap = AllocationBitmap::new();
        for _ in 0..10 {
            bitmap.allocate().unwrap();
        }

        bitmap.free(4);
        bitmap.free(7);
        assert!(!bitmap.is_allocated(4));
        assert!(!bitmap.is_allocated(7));

        // The cursor rewinds, so the lowest freed bit comes back first.
        assert_eq!(bitmap.allocate(), Some(4));
        assert_eq!(bitmap.allocate(), Some(7));
        assert_eq!(bitmap.allocate(), Some(11));
    }

    #[test]
    fn test_cursor_advances_past_full_words() {
        let mut bitmap = AllocationBitmap::new();
        // Fill the first two words completely (ids 0..128, 0 preset).
        for _ in 0..127 {
            bitmap.allocate().unwrap();
        }
        assert_eq!(bitmap.allocate(), Some(128));

        // Freeing inside an earlier word rewinds the scan.
        bitmap.free(63);
        assert_eq!(bitmap.allocate(), Some(63));
        assert_eq!(bitmap.allocate(), Some(129));
    }

    #[test]
    fn test_saturation() {
        let mut bitmap = AllocationBitmap::new();
        let mut count = 0u64;
        while bitmap.allocate().is_some() {
            count += 1;
        }
        // Every block except the bitmap block itself.
        assert_eq!(count, MAX_BLOCKS - 1);
        assert_eq!(bitmap.allocated_count(), MAX_BLOCKS);
        assert_eq!(bitmap.allocate(), None);

        bitmap.free(77);
        assert_eq!(bitmap.allocate(), Some(77));
    }

    #[test]
    fn test_block_roundtrip() {
        let mut bitmap = AllocationBitmap::new();
        for _ in 0..100 {
            bitmap.allocate().unwrap();
        }
        bitmap.free(33);

        let mut block = BlockBuffer::zeroed(BlockHandle::NULL);
        bitmap.write_to(&mut block);
        let restored = AllocationBitmap::from_block(&block);

        assert_eq!(restored.allocated_count(), bitmap.allocated_count());
        assert!(!restored.is_allocated(33));
        assert!(restored.is_allocated(100));
    }

    #[test]
    fn test_from_block_pins_bit_zero() {
        let block = BlockBuffer::zeroed(BlockHandle::NULL);
        let restored = AllocationBitmap::from_block(&block);
        assert!(restored.is_allocated(0));
    }
}
