//! Common helpers for end-to-end tests.

use crate::block::MemoryBlockStore;
use crate::btree::{BTree, TreeFlags, TreeIter};
use crate::error::Error;
use crate::testing::{BLOCK_SIZE, TreeShape, WrittenTree, u64_key, write_tree};

/// Address the first node of a helper-built tree lands at.
pub const TREE_BASE: u64 = 100;

/// A physical `u64`-keyed tree whose values are the keys' bytes, keeping
/// the node list for tests that damage individual nodes.
pub fn physical_u64_tree(
    keys: &[u64],
    leaf_capacity: usize,
    fanout: usize,
) -> (MemoryBlockStore, WrittenTree) {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    let shape = TreeShape::physical(TreeFlags::UINT64_KEYS, Some((8, 8)))
        .capacity(leaf_capacity, fanout);
    let tree = write_tree(&mut store, TREE_BASE, &u64_entries(keys), &shape);
    (store, tree)
}

/// `(key, value)` pairs with both sides the key's little-endian bytes.
pub fn u64_entries(keys: &[u64]) -> Vec<(Vec<u8>, Vec<u8>)> {
    keys.iter()
        .map(|key| (u64_key(*key).to_vec(), key.to_le_bytes().to_vec()))
        .collect()
}

/// Decode the leading `u64` of a key.
pub fn key_u64(key: &[u8]) -> u64 {
    u64::from_le_bytes(key[..8].try_into().expect("8-byte key"))
}

/// Keys yielded by an iterator that must not fail.
pub fn collect_keys(iter: TreeIter<'_>) -> Vec<u64> {
    iter.map(|entry| key_u64(&entry.expect("entry").0)).collect()
}

/// Walk every entry, returning the first error.
pub fn walk(tree: &BTree<'_>) -> Result<usize, Error> {
    let mut count = 0;
    for entry in tree.iter() {
        entry?;
        count += 1;
    }
    Ok(count)
}
