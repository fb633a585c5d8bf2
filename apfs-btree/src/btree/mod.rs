//! The generic on-disk B-tree.
//!
//! Every index in a container (object maps, file-system trees, extent
//! reference trees, snapshot metadata) uses this node format. Trees differ
//! only in their key order and in how non-leaf values locate children.
//!
//! # Structure
//!
//! - Root node: carries a 40-byte `btree_info_t` trailer with tree-wide flags
//!   and fixed key/value sizes
//! - Index nodes: values are 8-byte child references
//! - Leaf nodes: values are returned to the caller verbatim
//!
//! # Usage
//!
//! ```
//! use apfs_btree::btree::{Bytewise, KeyComparator, U64Keys};
//! use std::cmp::Ordering;
//!
//! // u64 keys compare numerically, not bytewise.
//! let two = 2u64.to_le_bytes();
//! let big = 256u64.to_le_bytes();
//! assert_eq!(U64Keys.compare(&two, &big), Ordering::Less);
//! assert_eq!(Bytewise.compare(&two, &big), Ordering::Greater);
//! ```

mod compare;
mod info;
mod iter;
mod node;
mod tree;

pub use compare::{Bytewise, KeyComparator, OmapKeys, U64Keys};
pub use info::{
    BTREE_NODE_MIN_ENTRY_COUNT, BTREE_NODE_SIZE_DEFAULT, BTREE_TOC_ENTRY_INCREMENT,
    BTREE_TOC_ENTRY_MAX_UNUSED, BTreeInfo, TreeConfig, TreeFlags, TreeSpace,
};
pub use iter::{KeyRange, TreeIter};
pub use node::{
    BTOFF_INVALID, CHILD_REF_SIZE, KVLOC_SIZE, KVOFF_SIZE, MAX_NODE_SIZE, NODE_HEADER_SIZE, Nloc,
    Node, NodeError, NodeFlags, ParseContext,
};
pub use tree::{BTree, ChildRef};
