//! Ephemeral trees located through the checkpoint mapping.

use crate::NavigatorConfig;
use crate::block::MemoryBlockStore;
use crate::btree::{BTree, ChildRef, TreeFlags, U64Keys};
use crate::error::Error;
use crate::object::{ObjectType, StorageKind, encode_type};
use crate::omap::{CheckpointMapping, EphemeralMap, ObjectResolver};
use crate::testing::{BLOCK_SIZE, NodeBuilder, checkpoint_map_block, u64_key};

const ROOT_OID: u64 = 0x400;

fn mapping(oid: u64, paddr: u64) -> CheckpointMapping {
    CheckpointMapping {
        object_type: encode_type(ObjectType::Btree, StorageKind::Ephemeral),
        subtype: ObjectType::SpacemanFreeQueue as u32,
        size: BLOCK_SIZE as u32,
        fs_oid: 0,
        oid,
        paddr,
    }
}

/// Root 0x400 at block 200 with leaves 0x401 and 0x402 at blocks 201 and
/// 202, plus a checkpoint map at block 50 recording those locations.
fn ephemeral_store() -> MemoryBlockStore {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    store.insert(
        200,
        NodeBuilder::new(ROOT_OID, 1)
            .ephemeral()
            .root(TreeFlags::EPHEMERAL | TreeFlags::UINT64_KEYS)
            .fixed(8, 8)
            .node_count(3)
            .entry(&u64_key(1), &0x401u64.to_le_bytes())
            .entry(&u64_key(10), &0x402u64.to_le_bytes())
            .build(),
    );
    store.insert(
        201,
        NodeBuilder::new(0x401, 0)
            .ephemeral()
            .fixed(8, 8)
            .entry(&u64_key(1), &100u64.to_le_bytes())
            .entry(&u64_key(5), &500u64.to_le_bytes())
            .build(),
    );
    store.insert(
        202,
        NodeBuilder::new(0x402, 0)
            .ephemeral()
            .fixed(8, 8)
            .entry(&u64_key(10), &1000u64.to_le_bytes())
            .build(),
    );
    store.insert(
        50,
        checkpoint_map_block(
            50,
            &[
                mapping(ROOT_OID, 200),
                mapping(0x401, 201),
                mapping(0x402, 202),
            ],
            true,
        ),
    );
    store
}

#[test]
fn test_search_through_checkpoint_map() {
    let store = ephemeral_store();
    let map = EphemeralMap::load(&store, NavigatorConfig::default(), [50]).expect("load");
    let resolver =
        ObjectResolver::physical(&store, NavigatorConfig::default()).with_ephemeral_map(&map);

    let root = resolver.ephemeral_address(ROOT_OID).expect("root mapped");
    let tree = BTree::open(&resolver, ChildRef::Direct(root), &U64Keys).expect("open");

    assert_eq!(
        tree.search(&u64_key(5)).expect("search"),
        Some(500u64.to_le_bytes().to_vec())
    );
    assert_eq!(
        tree.search(&u64_key(10)).expect("search"),
        Some(1000u64.to_le_bytes().to_vec())
    );
    assert_eq!(tree.search(&u64_key(7)).expect("search"), None);
    assert_eq!(tree.iter().count(), 3);
}

#[test]
fn test_child_missing_from_checkpoint_map() {
    let mut store = ephemeral_store();
    store.insert(
        50,
        checkpoint_map_block(50, &[mapping(ROOT_OID, 200), mapping(0x401, 201)], true),
    );
    let map = EphemeralMap::load(&store, NavigatorConfig::default(), [50]).expect("load");
    let resolver =
        ObjectResolver::physical(&store, NavigatorConfig::default()).with_ephemeral_map(&map);
    let tree = BTree::open(&resolver, ChildRef::Direct(200), &U64Keys).expect("open");

    assert!(tree.search(&u64_key(1)).expect("search").is_some());
    assert!(matches!(
        tree.search(&u64_key(10)),
        Err(Error::NotFound { oid: 0x402, .. })
    ));
}

#[test]
fn test_checkpoint_map_points_at_wrong_object() {
    let mut store = ephemeral_store();
    // 0x402 recorded at the block holding 0x401.
    store.insert(
        50,
        checkpoint_map_block(
            50,
            &[
                mapping(ROOT_OID, 200),
                mapping(0x401, 201),
                mapping(0x402, 201),
            ],
            true,
        ),
    );
    let map = EphemeralMap::load(&store, NavigatorConfig::default(), [50]).expect("load");
    let resolver =
        ObjectResolver::physical(&store, NavigatorConfig::default()).with_ephemeral_map(&map);
    let tree = BTree::open(&resolver, ChildRef::Direct(200), &U64Keys).expect("open");

    assert!(matches!(
        tree.search(&u64_key(10)),
        Err(Error::CorruptMapping { oid: 0x402, .. })
    ));
}
