//! Virtual trees navigated through an object map.

use crate::NavigatorConfig;
use crate::block::MemoryBlockStore;
use crate::btree::{BTree, Bytewise, ChildRef, KeyRange, TreeFlags, U64Keys};
use crate::e2e_tests::helpers::*;
use crate::error::Error;
use crate::omap::{ObjectMap, ObjectResolver};
use crate::testing::{BLOCK_SIZE, NodeBuilder, OmapBuilder, TreeShape, u64_key, write_tree};

const OMAP_ADDRESS: u64 = 10;

#[test]
fn test_resolve_between_versions() {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    let omap = OmapBuilder::new(OMAP_ADDRESS)
        .mapping(7, 3, 0xA0)
        .mapping(7, 9, 0xB0)
        .write(&mut store);
    let omap = ObjectMap::open(&store, NavigatorConfig::default(), omap).expect("open omap");
    let resolver = ObjectResolver::with_object_map(omap, 5);

    assert_eq!(resolver.resolve(7, 5).expect("resolve"), 0xA0);
    assert_eq!(resolver.resolve(7, 9).expect("resolve"), 0xB0);
    assert!(matches!(
        resolver.resolve(7, 2),
        Err(Error::NotFound { oid: 7, xid: 2 })
    ));
}

#[test]
fn test_multi_level_virtual_tree() {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    let keys: Vec<u64> = (0..300).map(|k| k * 2 + 1).collect();
    let shape = TreeShape {
        flags: TreeFlags::UINT64_KEYS,
        xid: 5,
        ..TreeShape::physical(TreeFlags::UINT64_KEYS, Some((8, 8))).capacity(8, 4)
    };
    let tree = write_tree(&mut store, TREE_BASE, &u64_entries(&keys), &shape);
    // A multi-level object map too.
    let omap = OmapBuilder::new(OMAP_ADDRESS)
        .leaf_capacity(4)
        .tree(&tree, 5)
        .write(&mut store);

    let omap = ObjectMap::open(&store, NavigatorConfig::default(), omap).expect("open omap");
    let resolver = ObjectResolver::with_object_map(omap, 5);
    let btree = BTree::open(&resolver, ChildRef::Indirect(tree.root), &U64Keys).expect("open");

    assert!(btree.height() >= 3);
    assert_eq!(
        btree.search(&u64_key(301)).expect("search"),
        Some(301u64.to_le_bytes().to_vec())
    );
    assert_eq!(btree.search(&u64_key(300)).expect("search"), None);

    let keys_seen = collect_keys(btree.range(KeyRange::inclusive(u64_key(100), u64_key(120))));
    assert_eq!(keys_seen, vec![101, 103, 105, 107, 109, 111, 113, 115, 117, 119]);
    assert_eq!(walk(&btree).expect("walk"), 300);
}

#[test]
fn test_snapshot_views_of_a_root() {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    let root_oid = 0x2000;
    for (address, xid, value) in [(300u64, 3u64, b"old"), (301, 9, b"new")] {
        store.insert(
            address,
            NodeBuilder::new(root_oid, 0)
                .xid(xid)
                .virtual_storage()
                .root(TreeFlags::empty())
                .entry(b"name", value)
                .build(),
        );
    }
    let omap = OmapBuilder::new(OMAP_ADDRESS)
        .mapping(root_oid, 3, 300)
        .mapping(root_oid, 9, 301)
        .write(&mut store);
    let omap = ObjectMap::open(&store, NavigatorConfig::default(), omap).expect("open omap");
    let latest = ObjectResolver::with_object_map(omap, 20);

    let older = latest.as_of(5);
    let tree = BTree::open(&older, ChildRef::Indirect(root_oid), &Bytewise).expect("open");
    assert_eq!(tree.search(b"name").expect("search"), Some(b"old".to_vec()));

    let tree = BTree::open(&latest, ChildRef::Indirect(root_oid), &Bytewise).expect("open");
    assert_eq!(tree.search(b"name").expect("search"), Some(b"new".to_vec()));

    let before = latest.as_of(1);
    assert!(matches!(
        BTree::open(&before, ChildRef::Indirect(root_oid), &Bytewise),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn test_unmapped_child() {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    store.insert(
        300,
        NodeBuilder::new(0x3000, 1)
            .virtual_storage()
            .root(TreeFlags::empty())
            .node_count(2)
            .entry(b"a", &0x3001u64.to_le_bytes())
            .build(),
    );
    let omap = OmapBuilder::new(OMAP_ADDRESS)
        .mapping(0x3000, 1, 300)
        .write(&mut store);
    let omap = ObjectMap::open(&store, NavigatorConfig::default(), omap).expect("open omap");
    let resolver = ObjectResolver::with_object_map(omap, 1);
    let tree = BTree::open(&resolver, ChildRef::Indirect(0x3000), &Bytewise).expect("open");

    assert!(matches!(
        tree.search(b"a"),
        Err(Error::NotFound { oid: 0x3001, .. })
    ));
}

#[test]
fn test_virtual_tree_needs_object_map() {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    store.insert(
        300,
        NodeBuilder::new(300, 1)
            .root(TreeFlags::empty())
            .node_count(2)
            .entry(b"a", &0x3001u64.to_le_bytes())
            .build(),
    );
    let resolver = ObjectResolver::physical(&store, NavigatorConfig::default());
    let tree = BTree::open(&resolver, ChildRef::Direct(300), &Bytewise).expect("open");

    assert!(matches!(
        tree.search(b"a"),
        Err(Error::UnsupportedKeySpace { oid: 0x3001 })
    ));
}
