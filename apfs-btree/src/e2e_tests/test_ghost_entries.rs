//! Ghost entries: present keys without values.

use crate::NavigatorConfig;
use crate::block::MemoryBlockStore;
use crate::btree::{BTree, Bytewise, ChildRef, NodeError, TreeFlags};
use crate::error::Error;
use crate::omap::ObjectResolver;
use crate::testing::NodeBuilder;

fn ghost_tree(flags: TreeFlags) -> MemoryBlockStore {
    let mut store = MemoryBlockStore::new(4096);
    store.insert(
        20,
        NodeBuilder::new(20, 1)
            .root(flags | TreeFlags::PHYSICAL)
            .node_count(3)
            .entry(b"a", &21u64.to_le_bytes())
            .entry(b"m", &22u64.to_le_bytes())
            .build(),
    );
    store.insert(
        21,
        NodeBuilder::new(21, 0)
            .entry(b"apple", b"1")
            .ghost(b"banana")
            .build(),
    );
    store.insert(
        22,
        NodeBuilder::new(22, 0)
            .ghost(b"mango")
            .entry(b"peach", b"2")
            .build(),
    );
    store
}

#[test]
fn test_ghost_differs_from_absent() {
    let store = ghost_tree(TreeFlags::ALLOW_GHOSTS);
    let resolver = ObjectResolver::physical(&store, NavigatorConfig::default());
    let tree = BTree::open(&resolver, ChildRef::Direct(20), &Bytewise).expect("open");

    assert_eq!(tree.search(b"banana").expect("search"), Some(Vec::new()));
    assert_eq!(tree.search(b"mango").expect("search"), Some(Vec::new()));
    assert_eq!(tree.search(b"apple").expect("search"), Some(b"1".to_vec()));
    assert_eq!(tree.search(b"cherry").expect("search"), None);
}

#[test]
fn test_iteration_yields_ghosts() {
    let store = ghost_tree(TreeFlags::ALLOW_GHOSTS);
    let resolver = ObjectResolver::physical(&store, NavigatorConfig::default());
    let tree = BTree::open(&resolver, ChildRef::Direct(20), &Bytewise).expect("open");

    let entries: Vec<_> = tree.iter().collect::<Result<_, _>>().expect("iterate");
    let expected: Vec<(Vec<u8>, Vec<u8>)> = vec![
        (b"apple".to_vec(), b"1".to_vec()),
        (b"banana".to_vec(), Vec::new()),
        (b"mango".to_vec(), Vec::new()),
        (b"peach".to_vec(), b"2".to_vec()),
    ];
    assert_eq!(entries, expected);
}

#[test]
fn test_ghost_in_tree_without_flag() {
    let store = ghost_tree(TreeFlags::empty());
    let resolver = ObjectResolver::physical(&store, NavigatorConfig::default());
    let tree = BTree::open(&resolver, ChildRef::Direct(20), &Bytewise).expect("open");

    assert!(matches!(
        tree.search(b"banana"),
        Err(Error::MalformedNode {
            address: 21,
            reason: NodeError::UnexpectedGhost { index: 1 }
        })
    ));
}
