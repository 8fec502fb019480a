//! Block storage for Strata.
//!
//! This crate provides:
//! - Raw block-granular file I/O
//! - An allocation bitmap persisted in block 0
//! - The block collection tying the two together

mod bitmap;
mod collection;
mod file;

pub use bitmap::AllocationBitmap;
pub use collection::BlockCollection;
pub use file::BlockFile;
