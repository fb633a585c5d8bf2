//! Read-only navigator for the APFS on-disk B-tree.
//!
//! Every APFS index (the object map, the file-system tree, the extent
//! reference tree, the snapshot metadata tree) shares one physical node
//! layout. This crate decodes that layout and walks it:
//!
//! - [`btree::Node`] validates a block and exposes its slot table
//! - [`btree::BTree`] searches and iterates from a root node down to leaves
//! - [`omap::ObjectResolver`] turns child references into physical blocks,
//!   going through the object map for virtual trees
//!
//! Block I/O stays with the caller behind [`block::BlockReader`].
//!
//! # Usage
//!
//! ```ignore
//! use apfs_btree::{NavigatorConfig, btree::{BTree, ChildRef, U64Keys}, omap::ObjectResolver};
//!
//! let resolver = ObjectResolver::physical(&store, NavigatorConfig::default());
//! let tree = BTree::open(&resolver, ChildRef::Direct(root_paddr), &U64Keys)?;
//! let value = tree.search(&100u64.to_le_bytes())?;
//! for entry in tree.iter() {
//!     let (key, value) = entry?;
//! }
//! ```

// Test code is allowed to use unwrap() and expect() for convenience.
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod block;
pub mod btree;
mod bytes;
pub mod config;
pub mod error;
pub mod object;
pub mod omap;

#[cfg(test)]
mod testing;

pub use block::{BlockError, BlockReader, MemoryBlockStore};
pub use config::{ConfigError, NavigatorConfig};
pub use error::Error;
pub use object::{ObjectHeader, Oid, Paddr, Xid};
