//! Block-level primitives shared by the collection and the tree.

use std::fmt;

/// Size of every block in a collection, in bytes (16 KB).
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Number of block handles addressable by a single-block allocation bitmap.
///
/// Block 0 holds one bit per potential block, so a collection can address at
/// most `8 * BLOCK_SIZE` blocks.
pub const MAX_BLOCKS: u64 = (8 * BLOCK_SIZE) as u64;

/// Upper bound on the number of internal levels in a tree stored in one
/// collection.
///
/// A minimum-occupancy tree of height `h` needs at least `2^(h+1) - 1`
/// blocks, and the collection holds fewer than `2^17`, so `h <= 16`.
pub const MAX_TREE_HEIGHT: usize = 16;

/// Identifier of a block within a collection.
///
/// Handles are produced only by the collection's allocator and may be reused
/// after a free; no arithmetic on them is meaningful. Handle 0 is reserved
/// for the allocation bitmap and is never handed to callers, which lets it
/// double as a null sentinel in node child slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle(u64);

impl BlockHandle {
    /// The null sentinel (the reserved bitmap block).
    pub const NULL: BlockHandle = BlockHandle(0);

    /// Creates a handle from a raw block index.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw block index.
    pub fn id(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the null sentinel.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An in-memory copy of one block, tagged with the handle it belongs to.
///
/// Buffers are mutated in place; nothing reaches disk until the buffer is
/// passed to the collection's `write`.
pub struct BlockBuffer {
    /// Raw block bytes.
    data: Box<[u8; BLOCK_SIZE]>,
    /// Handle this buffer was read from or allocated for.
    handle: BlockHandle,
}

impl BlockBuffer {
    /// Creates a zeroed buffer bound to the given handle.
    pub fn zeroed(handle: BlockHandle) -> Self {
        Self {
            data: Box::new([0u8; BLOCK_SIZE]),
            handle,
        }
    }

    /// Returns the handle this buffer is bound to.
    pub fn handle(&self) -> BlockHandle {
        self.handle
    }

    /// Rebinds the buffer to another handle.
    pub fn set_handle(&mut self, handle: BlockHandle) {
        self.handle = handle;
    }

    /// Returns the block bytes.
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    /// Returns the block bytes mutably.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }

    /// Resets the contents to all zeroes, keeping the handle.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

/// Header at the start of every tree node block.
///
/// Layout (16 bytes):
/// - degree: 8 bytes (leaf: number of values; branch: number of children)
/// - reserved: 8 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Number of child blocks (branch) or values (leaf).
    pub degree: u64,
}

impl NodeHeader {
    /// Size of the node header in bytes.
    pub const SIZE: usize = 16;

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.degree.to_le_bytes());
        // bytes 8-15 are reserved (already zeroed)
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            degree: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
        }
    }

    /// Reads the degree field directly from a block.
    pub fn read_degree(block: &[u8; BLOCK_SIZE]) -> u64 {
        Self::from_bytes(&block[..Self::SIZE]).degree
    }

    /// Writes the degree field directly into a block.
    pub fn write_degree(block: &mut [u8; BLOCK_SIZE], degree: u64) {
        block[..Self::SIZE].copy_from_slice(&NodeHeader { degree }.to_bytes());
    }
}
