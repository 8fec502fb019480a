//! Block collection: an allocating, block-addressed file.

use crate::bitmap::AllocationBitmap;
use crate::file::BlockFile;
use std::path::Path;
use strata_common::{
    BlockBuffer, BlockHandle, CollectionConfig, Result, StrataError, MAX_BLOCKS,
};
use tracing::debug;

/// A paged file that hands out, reads, writes and reclaims fixed-size
/// blocks.
///
/// Block 0 persists the allocation bitmap and is never exposed to callers.
/// The bitmap is read once at open, mutated in memory, and written back on
/// `close` or `flush`; a crash in between may leak blocks but cannot
/// corrupt the structure of live ones.
pub struct BlockCollection {
    /// Backing file; `None` while the collection is closed.
    file: Option<BlockFile>,
    /// In-memory allocation state.
    bitmap: AllocationBitmap,
    /// Whether mutations are permitted.
    writable: bool,
    /// Collection settings.
    config: CollectionConfig,
}

impl BlockCollection {
    /// Creates a closed collection.
    pub fn new(config: CollectionConfig) -> Self {
        Self {
            file: None,
            bitmap: AllocationBitmap::new(),
            writable: false,
            config,
        }
    }

    /// Opens or creates the collection file at `path`.
    ///
    /// An empty file is initialized with a fresh bitmap; a non-empty file
    /// has its bitmap read from block 0. Any previously open file is
    /// closed first.
    pub fn open(&mut self, path: &Path, writable: bool) -> Result<()> {
        self.close()?;

        let file = BlockFile::open(path, writable, self.config.fsync_enabled)?;
        self.writable = writable;

        if file.num_blocks()? == 0 {
            self.bitmap = AllocationBitmap::new();
            let mut block = BlockBuffer::zeroed(BlockHandle::NULL);
            self.bitmap.write_to(&mut block);
            file.write_block(0, block.as_bytes())?;
        } else {
            let mut block = BlockBuffer::zeroed(BlockHandle::NULL);
            file.read_block(0, block.as_bytes_mut())?;
            self.bitmap = AllocationBitmap::from_block(&block);
        }

        self.file = Some(file);
        Ok(())
    }

    /// Flushes the bitmap and closes the file. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            if self.writable {
                let mut block = BlockBuffer::zeroed(BlockHandle::NULL);
                self.bitmap.write_to(&mut block);
                file.write_block(0, block.as_bytes())?;
                file.sync()?;
            }
        }
        Ok(())
    }

    /// Returns true while a file is attached.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Returns true if the collection was opened writable.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Claims a free block and returns its handle. Never returns block 0.
    pub fn allocate(&mut self) -> Result<BlockHandle> {
        self.require_open()?;
        self.require_writable()?;
        let id = self.bitmap.allocate().ok_or(StrataError::OutOfBlocks)?;
        debug!(block = id, "allocate block");
        Ok(BlockHandle::new(id))
    }

    /// Claims a free block and returns a zeroed buffer bound to it.
    pub fn allocate_buffer(&mut self) -> Result<BlockBuffer> {
        let handle = self.allocate()?;
        Ok(BlockBuffer::zeroed(handle))
    }

    /// Releases a block for reuse.
    pub fn free(&mut self, handle: BlockHandle) -> Result<()> {
        self.require_open()?;
        self.require_writable()?;
        Self::check_handle(handle)?;
        debug!(block = handle.id(), "free block");
        self.bitmap.free(handle.id());
        Ok(())
    }

    /// Releases the block a buffer is bound to.
    pub fn free_buffer(&mut self, buf: &BlockBuffer) -> Result<()> {
        self.free(buf.handle())
    }

    /// Reads the block at `handle` into a fresh buffer.
    pub fn read(&self, handle: BlockHandle) -> Result<BlockBuffer> {
        let mut buf = BlockBuffer::zeroed(handle);
        self.read_into(handle, &mut buf)?;
        Ok(buf)
    }

    /// Reads the block at `handle` into an existing buffer, rebinding it.
    pub fn read_into(&self, handle: BlockHandle, buf: &mut BlockBuffer) -> Result<()> {
        let file = self.file.as_ref().ok_or(StrataError::NotOpen)?;
        Self::check_handle(handle)?;
        buf.set_handle(handle);
        file.read_block(handle.id(), buf.as_bytes_mut())
    }

    /// Writes a buffer back to the block it is bound to.
    pub fn write(&self, buf: &BlockBuffer) -> Result<()> {
        let file = self.file.as_ref().ok_or(StrataError::NotOpen)?;
        if !self.writable {
            return Err(StrataError::ReadOnly);
        }
        Self::check_handle(buf.handle())?;
        file.write_block(buf.handle().id(), buf.as_bytes())
    }

    /// Writes the bitmap to block 0 without closing.
    pub fn flush(&mut self) -> Result<()> {
        let file = self.file.as_ref().ok_or(StrataError::NotOpen)?;
        self.require_writable()?;
        let mut block = BlockBuffer::zeroed(BlockHandle::NULL);
        self.bitmap.write_to(&mut block);
        file.write_block(0, block.as_bytes())?;
        file.sync()
    }

    /// Returns true if `handle` is currently allocated.
    pub fn is_allocated(&self, handle: BlockHandle) -> bool {
        handle.id() < MAX_BLOCKS && self.bitmap.is_allocated(handle.id())
    }

    fn require_open(&self) -> Result<()> {
        if self.file.is_some() {
            Ok(())
        } else {
            Err(StrataError::NotOpen)
        }
    }

    fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StrataError::ReadOnly)
        }
    }

    fn check_handle(handle: BlockHandle) -> Result<()> {
        if handle.is_null() || handle.id() >= MAX_BLOCKS {
            Err(StrataError::InvalidHandle(handle.id()))
        } else {
            Ok(())
        }
    }
}

impl Drop for BlockCollection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
