//! The spatial index: a node arena plus index-wide bookkeeping.
//!
//! [`QuadTree`] owns the nodes and implements insertion, subdivision,
//! removal and range traversal. [`QuadTreeIndex`] wraps one tree with its
//! lifecycle state, the membership registry and the counters that decide
//! when incremental maintenance should give way to a full rebuild.

mod index;
mod node;

pub use index::{IndexState, QuadTreeIndex};
pub use node::{QuadTree, QuadTreeNode, Quadrant, ROOT_KEY, TreeStats};
