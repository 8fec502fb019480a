//! Raw block-granular file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use strata_common::{Result, BLOCK_SIZE};

/// Reads and writes fixed-size blocks at absolute block indices.
///
/// Block `i` lives at byte offset `i * BLOCK_SIZE`. The file grows
/// implicitly when a block past the current end is written.
pub struct BlockFile {
    /// The open file handle.
    file: Mutex<File>,
    /// Path to the file.
    path: PathBuf,
    /// Enable fsync after writes.
    fsync_enabled: bool,
}

impl BlockFile {
    /// Opens or creates the file at `path`.
    ///
    /// A read-only file is never created; it must already exist.
    pub fn open(path: &Path, writable: bool, fsync_enabled: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            fsync_enabled,
        })
    }

    /// Returns the path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of whole blocks currently in the file.
    pub fn num_blocks(&self) -> Result<u64> {
        let file = self.file.lock();
        let len = file.metadata()?.len();
        Ok(len / BLOCK_SIZE as u64)
    }

    /// Reads block `index` into `buf`.
    pub fn read_block(&self, index: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index * BLOCK_SIZE as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Writes `data` as block `index`, extending the file if needed.
    pub fn write_block(&self, index: u64, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index * BLOCK_SIZE as u64))?;
        file.write_all(data)?;

        if self.fsync_enabled {
            file.sync_all()?;
        }

        Ok(())
    }

    /// Flushes all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
