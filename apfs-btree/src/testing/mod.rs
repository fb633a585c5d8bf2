//! Builders for on-disk structures used by unit and end-to-end tests.
//!
//! Every builder produces sealed blocks (valid checksum) unless a test
//! damages them afterwards.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::block::{BlockReader, MemoryBlockStore};
use crate::btree::{
    BTreeInfo, KVLOC_SIZE, KVOFF_SIZE, NODE_HEADER_SIZE, Nloc, Node, NodeFlags, ParseContext,
    TreeConfig, TreeFlags,
};
use crate::object::{
    CHECKSUM_SIZE, ObjectHeader, ObjectType, ObjectTypeFlags, Oid, Paddr, StorageKind, Xid,
    encode_type, object_checksum,
};
use crate::omap::{
    CheckpointMapBlock, CheckpointMapFlags, CheckpointMapping, OmapFlags, OmapKey, OmapPhys,
    OmapSnapshot, OmapSnapshotFlags, OmapValue, OmapValueFlags,
};

/// Block size used by every builder.
pub const BLOCK_SIZE: usize = 4096;

/// Offset added to a node's address to form its oid in virtual trees.
pub const VIRTUAL_OID_BASE: Oid = 0x1000;

static TRACING: Once = Once::new();

/// Route tracing output to the test harness, filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "apfs_btree=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Little-endian `u64` key bytes.
pub const fn u64_key(key: u64) -> [u8; 8] {
    key.to_le_bytes()
}

/// Object-map key bytes.
pub fn omap_key(oid: Oid, xid: Xid) -> [u8; 16] {
    OmapKey { oid, xid }.to_bytes()
}

/// Write the Fletcher-64 checksum into the first 8 bytes.
pub fn seal(block: &mut [u8]) {
    let checksum = object_checksum(block).expect("block is a whole number of words");
    block[..CHECKSUM_SIZE].copy_from_slice(&checksum.to_le_bytes());
}

/// Builds a single B-tree node block.
///
/// Keys are packed from the start of key storage in insertion order and
/// values are packed backward from the end of the value area. The table of
/// contents is sized in steps of eight entries.
pub struct NodeBuilder {
    oid: Oid,
    xid: Xid,
    level: u16,
    tree_flags: Option<TreeFlags>,
    fixed: Option<(usize, usize)>,
    entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    key_count: Option<u64>,
    node_count: u64,
    object_type: Option<ObjectType>,
    subtype: ObjectType,
    storage: StorageKind,
    type_flags: ObjectTypeFlags,
}

impl NodeBuilder {
    pub fn new(oid: Oid, level: u16) -> Self {
        Self {
            oid,
            xid: 1,
            level,
            tree_flags: None,
            fixed: None,
            entries: Vec::new(),
            key_count: None,
            node_count: 1,
            object_type: None,
            subtype: ObjectType::Invalid,
            storage: StorageKind::Physical,
            type_flags: ObjectTypeFlags::empty(),
        }
    }

    pub const fn xid(mut self, xid: Xid) -> Self {
        self.xid = xid;
        self
    }

    /// Mark the node as a tree root with the given tree flags.
    pub const fn root(mut self, flags: TreeFlags) -> Self {
        self.tree_flags = Some(flags);
        self
    }

    /// Use fixed-size entries; the sizes go into the trailer of a root.
    pub const fn fixed(mut self, key_size: usize, value_size: usize) -> Self {
        self.fixed = Some((key_size, value_size));
        self
    }

    pub fn entry(mut self, key: &[u8], value: &[u8]) -> Self {
        self.entries.push((key.to_vec(), Some(value.to_vec())));
        self
    }

    /// An entry whose value offset is the invalid sentinel.
    pub fn ghost(mut self, key: &[u8]) -> Self {
        self.entries.push((key.to_vec(), None));
        self
    }

    /// Key count recorded in the trailer; defaults to this node's entries.
    pub const fn key_count(mut self, count: u64) -> Self {
        self.key_count = Some(count);
        self
    }

    /// Node count recorded in the trailer.
    pub const fn node_count(mut self, count: u64) -> Self {
        self.node_count = count;
        self
    }

    pub const fn object_type(mut self, object_type: ObjectType) -> Self {
        self.object_type = Some(object_type);
        self
    }

    pub const fn subtype(mut self, subtype: ObjectType) -> Self {
        self.subtype = subtype;
        self
    }

    pub const fn type_flags(mut self, flags: ObjectTypeFlags) -> Self {
        self.type_flags = flags;
        self
    }

    pub const fn ephemeral(mut self) -> Self {
        self.storage = StorageKind::Ephemeral;
        self
    }

    pub const fn virtual_storage(mut self) -> Self {
        self.storage = StorageKind::Virtual;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let size = BLOCK_SIZE;
        let is_root = self.tree_flags.is_some();
        let value_end = if is_root {
            size - BTreeInfo::SIZE
        } else {
            size
        };

        let entry_size = if self.fixed.is_some() {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        };
        let toc_entries = self.entries.len().div_ceil(8).max(1) * 8;
        let toc_len = toc_entries * entry_size;
        let key_start = NODE_HEADER_SIZE + toc_len;

        let mut block = vec![0u8; size];
        let mut key_off = 0usize;
        let mut value_off = 0usize;
        for (index, (key, value)) in self.entries.iter().enumerate() {
            let at = key_start + key_off;
            block[at..at + key.len()].copy_from_slice(key);

            let value_loc = match value {
                Some(value) => {
                    value_off += value.len();
                    let start = value_end - value_off;
                    block[start..start + value.len()].copy_from_slice(value);
                    Nloc {
                        off: value_off as u16,
                        len: value.len() as u16,
                    }
                }
                None => Nloc::INVALID,
            };

            let toc = NODE_HEADER_SIZE + index * entry_size;
            if self.fixed.is_some() {
                block[toc..toc + 2].copy_from_slice(&(key_off as u16).to_le_bytes());
                block[toc + 2..toc + 4].copy_from_slice(&value_loc.off.to_le_bytes());
            } else {
                let key_loc = Nloc {
                    off: key_off as u16,
                    len: key.len() as u16,
                };
                block[toc..toc + 4].copy_from_slice(&key_loc.to_bytes());
                block[toc + 4..toc + 8].copy_from_slice(&value_loc.to_bytes());
            }
            key_off += key.len();
        }

        let mut flags = NodeFlags::empty();
        flags.set(NodeFlags::ROOT, is_root);
        flags.set(NodeFlags::LEAF, self.level == 0);
        flags.set(NodeFlags::FIXED_KV_SIZE, self.fixed.is_some());

        let object_type = self.object_type.unwrap_or(if is_root {
            ObjectType::Btree
        } else {
            ObjectType::BtreeNode
        });
        let header = ObjectHeader {
            checksum: 0,
            oid: self.oid,
            xid: self.xid,
            type_and_flags: encode_type(object_type, self.storage) | self.type_flags.bits(),
            subtype: self.subtype as u32,
        };
        block[..32].copy_from_slice(&header.to_bytes());
        block[32..34].copy_from_slice(&flags.bits().to_le_bytes());
        block[34..36].copy_from_slice(&self.level.to_le_bytes());
        block[36..40].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());

        let table_space = Nloc {
            off: 0,
            len: toc_len as u16,
        };
        let free_start = key_start + key_off;
        let free_space = Nloc {
            off: key_off as u16,
            len: (value_end - value_off - free_start) as u16,
        };
        block[40..44].copy_from_slice(&table_space.to_bytes());
        block[44..48].copy_from_slice(&free_space.to_bytes());
        block[48..52].copy_from_slice(&Nloc::INVALID.to_bytes());
        block[52..56].copy_from_slice(&Nloc::INVALID.to_bytes());

        if let Some(tree_flags) = self.tree_flags {
            let (key_size, val_size) = self.fixed.unwrap_or((0, 0));
            let longest = |pick: fn(&(Vec<u8>, Option<Vec<u8>>)) -> usize| {
                self.entries.iter().map(pick).max().unwrap_or(0) as u32
            };
            let info = BTreeInfo {
                flags: tree_flags,
                node_size: size as u32,
                key_size: key_size as u32,
                val_size: val_size as u32,
                longest_key: longest(|(key, _)| key.len()),
                longest_val: longest(|(_, value)| value.as_ref().map_or(0, Vec::len)),
                key_count: self.key_count.unwrap_or(self.entries.len() as u64),
                node_count: self.node_count,
            };
            block[value_end..].copy_from_slice(&info.to_bytes());
        }

        seal(&mut block);
        block
    }
}

/// Shape of a tree written by [`write_tree`].
#[derive(Debug, Clone, Copy)]
pub struct TreeShape {
    /// Tree flags; the address space follows `PHYSICAL` and `EPHEMERAL`.
    pub flags: TreeFlags,
    /// Fixed key and leaf value sizes, or `None` for variable-size nodes.
    pub fixed: Option<(usize, usize)>,
    pub leaf_capacity: usize,
    pub fanout: usize,
    pub xid: Xid,
    pub subtype: ObjectType,
}

impl TreeShape {
    pub fn physical(flags: TreeFlags, fixed: Option<(usize, usize)>) -> Self {
        Self {
            flags: flags | TreeFlags::PHYSICAL,
            fixed,
            leaf_capacity: 8,
            fanout: 8,
            xid: 1,
            subtype: ObjectType::Invalid,
        }
    }

    pub const fn capacity(mut self, leaf_capacity: usize, fanout: usize) -> Self {
        self.leaf_capacity = leaf_capacity;
        self.fanout = fanout;
        self
    }

    fn storage(&self) -> StorageKind {
        if self.flags.contains(TreeFlags::PHYSICAL) {
            StorageKind::Physical
        } else if self.flags.contains(TreeFlags::EPHEMERAL) {
            StorageKind::Ephemeral
        } else {
            StorageKind::Virtual
        }
    }

    fn oid_of(&self, address: Paddr) -> Oid {
        match self.storage() {
            StorageKind::Virtual => address + VIRTUAL_OID_BASE,
            StorageKind::Physical | StorageKind::Ephemeral => address,
        }
    }
}

/// Where a written tree landed.
#[derive(Debug, Clone)]
pub struct WrittenTree {
    /// Oid of the root (its address for physical and ephemeral trees).
    pub root: Oid,
    /// Address of the root block.
    pub root_address: Paddr,
    /// `(oid, address)` of every node, root first.
    pub nodes: Vec<(Oid, Paddr)>,
    /// First address after the tree.
    pub next: Paddr,
}

struct PlannedNode {
    first_key: Vec<u8>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    children: Vec<usize>,
}

/// Write a tree holding `entries` (already sorted) into `store`.
///
/// Leaves hold up to `leaf_capacity` entries and index nodes up to
/// `fanout` children, with each separator equal to the first key of its
/// child. Nodes get consecutive addresses from `base`, root first, then
/// level by level down to the leaves.
pub fn write_tree(
    store: &mut MemoryBlockStore,
    base: Paddr,
    entries: &[(Vec<u8>, Vec<u8>)],
    shape: &TreeShape,
) -> WrittenTree {
    let mut levels: Vec<Vec<PlannedNode>> = Vec::new();
    let leaves: Vec<PlannedNode> = if entries.is_empty() {
        vec![PlannedNode {
            first_key: Vec::new(),
            entries: Vec::new(),
            children: Vec::new(),
        }]
    } else {
        entries
            .chunks(shape.leaf_capacity)
            .map(|chunk| PlannedNode {
                first_key: chunk[0].0.clone(),
                entries: chunk.to_vec(),
                children: Vec::new(),
            })
            .collect()
    };
    levels.push(leaves);
    while levels.last().map_or(0, Vec::len) > 1 {
        let below = levels.last().expect("at least one level");
        let indices: Vec<usize> = (0..below.len()).collect();
        let parents = indices
            .chunks(shape.fanout)
            .map(|chunk| PlannedNode {
                first_key: below[chunk[0]].first_key.clone(),
                entries: Vec::new(),
                children: chunk.to_vec(),
            })
            .collect();
        levels.push(parents);
    }

    // Addresses top-down: root first, leaves last.
    let mut addresses: Vec<Vec<Paddr>> = vec![Vec::new(); levels.len()];
    let mut next = base;
    for (level, nodes) in levels.iter().enumerate().rev() {
        for _ in nodes {
            addresses[level].push(next);
            next += 1;
        }
    }

    let height = levels.len();
    let node_count: usize = levels.iter().map(Vec::len).sum();
    let storage = shape.storage();
    let mut written = Vec::with_capacity(node_count);

    for (level, nodes) in levels.iter().enumerate().rev() {
        let is_root = level + 1 == height;
        for (index, planned) in nodes.iter().enumerate() {
            let address = addresses[level][index];
            let oid = shape.oid_of(address);
            let mut builder = NodeBuilder::new(oid, level as u16)
                .xid(shape.xid)
                .subtype(shape.subtype);
            builder.storage = storage;
            if let Some((key_size, value_size)) = shape.fixed {
                builder = builder.fixed(key_size, value_size);
            }
            if is_root {
                builder = builder
                    .root(shape.flags)
                    .node_count(node_count as u64)
                    .key_count(entries.len() as u64);
            }
            if level == 0 {
                for (key, value) in &planned.entries {
                    builder = builder.entry(key, value);
                }
            } else {
                for &child in &planned.children {
                    let child_oid = shape.oid_of(addresses[level - 1][child]);
                    builder =
                        builder.entry(&levels[level - 1][child].first_key, &child_oid.to_le_bytes());
                }
            }
            store.insert(address, builder.build());
            written.push((oid, address));
        }
    }

    let root_address = addresses[height - 1][0];
    WrittenTree {
        root: shape.oid_of(root_address),
        root_address,
        nodes: written,
        next,
    }
}

/// A physical `u64`-keyed tree whose values equal their keys.
pub fn u64_tree(keys: &[u64], leaf_capacity: usize, fanout: usize) -> (MemoryBlockStore, Paddr) {
    let mut store = MemoryBlockStore::new(BLOCK_SIZE);
    let entries: Vec<(Vec<u8>, Vec<u8>)> = keys
        .iter()
        .map(|key| (u64_key(*key).to_vec(), key.to_le_bytes().to_vec()))
        .collect();
    let shape = TreeShape::physical(TreeFlags::UINT64_KEYS, Some((8, 8)))
        .capacity(leaf_capacity, fanout);
    let tree = write_tree(&mut store, 100, &entries, &shape);
    (store, tree.root_address)
}

/// Leaf addresses of a physical tree, in key order.
pub fn leaf_addresses(store: &MemoryBlockStore, root: Paddr) -> Vec<Paddr> {
    let data = store.read_block(root).expect("root block");
    let root_node = Node::parse(root, data, &ParseContext::root(false)).expect("root parses");
    let info = *root_node.tree_info().expect("root has tree info");
    let config = TreeConfig::from_info(info).expect("valid tree info");

    let mut leaves = Vec::new();
    let mut stack = vec![root_node];
    while let Some(node) = stack.pop() {
        if node.is_leaf() {
            leaves.push(node.address());
            continue;
        }
        for index in (0..node.key_count()).rev() {
            let address = node.child_ref(index).expect("child reference");
            let data = store.read_block(address).expect("child block");
            let ctx = ParseContext::child(false, &config);
            stack.push(Node::parse(address, data, &ctx).expect("child parses"));
        }
    }
    leaves
}

/// Builds an object map plus its mapping and snapshot trees.
pub struct OmapBuilder {
    address: Paddr,
    flags: OmapFlags,
    mappings: Vec<(OmapKey, OmapValue)>,
    snapshots: Vec<(Xid, OmapSnapshot)>,
    leaf_capacity: usize,
}

impl OmapBuilder {
    /// The object map lives at `address`; its trees follow it.
    pub const fn new(address: Paddr) -> Self {
        Self {
            address,
            flags: OmapFlags::empty(),
            mappings: Vec::new(),
            snapshots: Vec::new(),
            leaf_capacity: 64,
        }
    }

    /// Map `oid` at `xid` to a one-block object at `paddr`.
    pub fn mapping(self, oid: Oid, xid: Xid, paddr: Paddr) -> Self {
        self.mapping_with(oid, xid, OmapValueFlags::empty(), BLOCK_SIZE as u32, paddr)
    }

    pub fn mapping_with(
        mut self,
        oid: Oid,
        xid: Xid,
        flags: OmapValueFlags,
        size: u32,
        paddr: Paddr,
    ) -> Self {
        self.mappings
            .push((OmapKey { oid, xid }, OmapValue { flags, size, paddr }));
        self
    }

    /// Map every node of a written virtual tree at `xid`.
    pub fn tree(mut self, tree: &WrittenTree, xid: Xid) -> Self {
        for &(oid, paddr) in &tree.nodes {
            self = self.mapping(oid, xid, paddr);
        }
        self
    }

    pub fn snapshot(mut self, xid: Xid, flags: OmapSnapshotFlags) -> Self {
        self.snapshots.push((xid, OmapSnapshot { flags, oid: 0 }));
        self
    }

    pub const fn flags(mut self, flags: OmapFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Mapping-tree leaf capacity, to force multi-level object maps.
    pub const fn leaf_capacity(mut self, capacity: usize) -> Self {
        self.leaf_capacity = capacity;
        self
    }

    /// Address of the mapping tree root.
    pub const fn tree_address(&self) -> Paddr {
        self.address + 1
    }

    /// Write the object map and its trees; returns the object map address.
    pub fn write(&self, store: &mut MemoryBlockStore) -> Paddr {
        let mut mappings = self.mappings.clone();
        mappings.sort_by_key(|(key, _)| (key.oid, key.xid));
        let entries: Vec<(Vec<u8>, Vec<u8>)> = mappings
            .iter()
            .map(|(key, value)| (key.to_bytes().to_vec(), value.to_bytes().to_vec()))
            .collect();
        let shape = TreeShape {
            subtype: ObjectType::Omap,
            ..TreeShape::physical(TreeFlags::empty(), Some((OmapKey::SIZE, OmapValue::SIZE)))
                .capacity(self.leaf_capacity, 8)
        };
        let tree = write_tree(store, self.tree_address(), &entries, &shape);

        let mut snapshot_tree_oid = 0;
        if !self.snapshots.is_empty() {
            let mut snapshots = self.snapshots.clone();
            snapshots.sort_by_key(|(xid, _)| *xid);
            let entries: Vec<(Vec<u8>, Vec<u8>)> = snapshots
                .iter()
                .map(|(xid, snapshot)| (u64_key(*xid).to_vec(), snapshot.to_bytes().to_vec()))
                .collect();
            let shape = TreeShape {
                subtype: ObjectType::OmapSnapshot,
                ..TreeShape::physical(TreeFlags::UINT64_KEYS, Some((8, OmapSnapshot::SIZE)))
            };
            snapshot_tree_oid = write_tree(store, tree.next, &entries, &shape).root_address;
        }

        let btree_type = encode_type(ObjectType::Btree, StorageKind::Physical);
        let phys = OmapPhys {
            header: ObjectHeader {
                checksum: 0,
                oid: self.address,
                xid: 1,
                type_and_flags: encode_type(ObjectType::Omap, StorageKind::Physical),
                subtype: 0,
            },
            flags: self.flags,
            snap_count: self.snapshots.len() as u32,
            tree_type: btree_type,
            snapshot_tree_type: btree_type,
            tree_oid: tree.root_address,
            snapshot_tree_oid,
            most_recent_snap: self.snapshots.iter().map(|(xid, _)| *xid).max().unwrap_or(0),
            pending_revert_min: 0,
            pending_revert_max: 0,
        };
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..OmapPhys::SIZE].copy_from_slice(&phys.to_bytes());
        seal(&mut block);
        store.insert(self.address, block);
        self.address
    }
}

/// A sealed checkpoint-map block at `address`.
pub fn checkpoint_map_block(address: Paddr, mappings: &[CheckpointMapping], last: bool) -> Vec<u8> {
    let header = ObjectHeader {
        checksum: 0,
        oid: address,
        xid: 1,
        type_and_flags: encode_type(ObjectType::CheckpointMap, StorageKind::Physical),
        subtype: 0,
    };
    let flags = if last {
        CheckpointMapFlags::LAST
    } else {
        CheckpointMapFlags::empty()
    };

    let mut block = vec![0u8; BLOCK_SIZE];
    block[..32].copy_from_slice(&header.to_bytes());
    block[32..36].copy_from_slice(&flags.bits().to_le_bytes());
    block[36..40].copy_from_slice(&(mappings.len() as u32).to_le_bytes());
    for (i, mapping) in mappings.iter().enumerate() {
        let at = CheckpointMapBlock::HEADER_SIZE + i * CheckpointMapping::SIZE;
        block[at..at + CheckpointMapping::SIZE].copy_from_slice(&mapping.to_bytes());
    }
    seal(&mut block);
    block
}
