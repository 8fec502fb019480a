//! External-memory B+ tree for Strata.
//!
//! This crate provides:
//! - Leaf and branch node views over raw block buffers
//! - The tree engine: insert, erase, lookup, in-order traversal
//! - A bottom-up bulk builder for sorted input

mod branch;
mod builder;
mod leaf;
mod traits;
mod tree;
mod types;

pub use branch::BranchView;
pub use builder::BTreeBuilder;
pub use leaf::LeafView;
pub use traits::{TreeTraits, U64Traits};
pub use tree::BTree;
pub use types::{BuilderState, FuseOutcome, TreePath};
