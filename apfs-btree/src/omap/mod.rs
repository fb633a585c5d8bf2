//! Object maps and object resolution.
//!
//! An object map is a physical B-tree from `(oid, xid)` to the block that
//! holds that version of a virtual object. Virtual trees (volume file-system
//! trees, for example) store object ids in their index nodes and need an
//! object map to reach their children.
//!
//! # Structures
//!
//! - `omap_phys_t`: the object-map object, pointing at the mapping tree and
//!   the snapshot tree
//! - `omap_key_t`: `oid(8) xid(8)`, ordered by oid then xid
//! - `omap_val_t`: `flags(4) size(4) paddr(8)`
//! - `omap_snapshot_t`: `flags(4) pad(4) oid(8)`, keyed by xid

mod checkpoint;
mod resolver;

use bitflags::bitflags;

use crate::block::{BlockError, BlockReader};
use crate::btree::{BTree, ChildRef, KeyRange, OmapKeys, TreeSpace, U64Keys};
use crate::bytes::{read_u32, read_u64};
use crate::config::NavigatorConfig;
use crate::error::Error;
use crate::object::{
    OBJECT_HEADER_SIZE, OID_INVALID, ObjectHeader, ObjectType, Oid, Paddr, StorageKind, Xid,
    encode_type,
};

pub use checkpoint::{CheckpointMapBlock, CheckpointMapFlags, CheckpointMapping, EphemeralMap};
pub use resolver::{ObjectBlock, ObjectResolver};

bitflags! {
    /// Object-map flags (`om_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OmapFlags: u32 {
        const MANUALLY_MANAGED = 0x0000_0001;
        const ENCRYPTING = 0x0000_0002;
        const DECRYPTING = 0x0000_0004;
        const KEYROLLING = 0x0000_0008;
        const CRYPTO_GENERATION = 0x0000_0010;
    }
}

bitflags! {
    /// Object-map value flags (`ov_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OmapValueFlags: u32 {
        const DELETED = 0x0000_0001;
        const SAVED = 0x0000_0002;
        const ENCRYPTED = 0x0000_0004;
        const NOHEADER = 0x0000_0008;
        const CRYPTO_GENERATION = 0x0000_0010;
    }
}

bitflags! {
    /// Snapshot flags (`oms_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OmapSnapshotFlags: u32 {
        const DELETED = 0x0000_0001;
        const REVERTED = 0x0000_0002;
    }
}

/// The decoded `omap_phys_t` object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapPhys {
    pub header: ObjectHeader,
    pub flags: OmapFlags,
    pub snap_count: u32,
    /// Object type of the mapping tree (storage kind plus `BTREE`).
    pub tree_type: u32,
    pub snapshot_tree_type: u32,
    /// Physical address of the mapping tree root.
    pub tree_oid: Oid,
    /// Physical address of the snapshot tree root, or 0.
    pub snapshot_tree_oid: Oid,
    pub most_recent_snap: Xid,
    pub pending_revert_min: Xid,
    pub pending_revert_max: Xid,
}

impl OmapPhys {
    /// Size of the structure in bytes.
    pub const SIZE: usize = OBJECT_HEADER_SIZE + 56;

    /// Read the structure from the start of a block.
    #[must_use]
    pub fn read(block: &[u8]) -> Option<Self> {
        if block.len() < Self::SIZE {
            return None;
        }
        let header = ObjectHeader::read(block)?;
        Some(Self {
            header,
            flags: OmapFlags::from_bits_retain(read_u32(block, 32)),
            snap_count: read_u32(block, 36),
            tree_type: read_u32(block, 40),
            snapshot_tree_type: read_u32(block, 44),
            tree_oid: read_u64(block, 48),
            snapshot_tree_oid: read_u64(block, 56),
            most_recent_snap: read_u64(block, 64),
            pending_revert_min: read_u64(block, 72),
            pending_revert_max: read_u64(block, 80),
        })
    }

    /// Serialize the structure, header included.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..OBJECT_HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
        buf[32..36].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[36..40].copy_from_slice(&self.snap_count.to_le_bytes());
        buf[40..44].copy_from_slice(&self.tree_type.to_le_bytes());
        buf[44..48].copy_from_slice(&self.snapshot_tree_type.to_le_bytes());
        buf[48..56].copy_from_slice(&self.tree_oid.to_le_bytes());
        buf[56..64].copy_from_slice(&self.snapshot_tree_oid.to_le_bytes());
        buf[64..72].copy_from_slice(&self.most_recent_snap.to_le_bytes());
        buf[72..80].copy_from_slice(&self.pending_revert_min.to_le_bytes());
        buf[80..88].copy_from_slice(&self.pending_revert_max.to_le_bytes());
        buf
    }
}

/// An object-map key (`omap_key_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OmapKey {
    pub oid: Oid,
    pub xid: Xid,
}

impl OmapKey {
    pub const SIZE: usize = 16;

    /// Decode a key; `None` unless exactly 16 bytes.
    #[must_use]
    pub const fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            oid: read_u64(bytes, 0),
            xid: read_u64(bytes, 8),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.oid.to_le_bytes());
        buf[8..16].copy_from_slice(&self.xid.to_le_bytes());
        buf
    }
}

/// An object-map value (`omap_val_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapValue {
    pub flags: OmapValueFlags,
    /// Size of the object in bytes.
    pub size: u32,
    pub paddr: Paddr,
}

impl OmapValue {
    pub const SIZE: usize = 16;

    /// Decode a value; `None` unless exactly 16 bytes.
    #[must_use]
    pub const fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            flags: OmapValueFlags::from_bits_retain(read_u32(bytes, 0)),
            size: read_u32(bytes, 4),
            paddr: read_u64(bytes, 8),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.paddr.to_le_bytes());
        buf
    }
}

/// A snapshot record (`omap_snapshot_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapSnapshot {
    pub flags: OmapSnapshotFlags,
    /// Reserved; always zero on disk.
    pub oid: Oid,
}

impl OmapSnapshot {
    pub const SIZE: usize = 16;

    #[must_use]
    pub const fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            flags: OmapSnapshotFlags::from_bits_retain(read_u32(bytes, 0)),
            oid: read_u64(bytes, 8),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[8..16].copy_from_slice(&self.oid.to_le_bytes());
        buf
    }
}

/// A matched object-map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapMapping {
    pub key: OmapKey,
    pub value: OmapValue,
}

/// An opened object map.
///
/// Holds only the decoded `omap_phys_t`; the mapping tree is read afresh on
/// every lookup.
#[derive(Clone)]
pub struct ObjectMap<'r> {
    reader: &'r dyn BlockReader,
    config: NavigatorConfig,
    address: Paddr,
    phys: OmapPhys,
}

impl std::fmt::Debug for ObjectMap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMap")
            .field("address", &self.address)
            .field("phys", &self.phys)
            .finish_non_exhaustive()
    }
}

impl<'r> ObjectMap<'r> {
    /// Read and validate the object map at `address`.
    pub fn open(
        reader: &'r dyn BlockReader,
        config: NavigatorConfig,
        address: Paddr,
    ) -> Result<Self, Error> {
        let block = ObjectResolver::physical(reader, config).read_child(ChildRef::Direct(address))?;
        if block.header.object_type() != Ok(ObjectType::Omap) {
            return Err(Error::UnexpectedObjectType {
                address,
                expected: "object map",
                found: block.header.type_and_flags,
            });
        }
        let phys = OmapPhys::read(&block.data).ok_or(Error::Block {
            address,
            source: BlockError::ShortRead {
                expected: OmapPhys::SIZE,
                actual: block.data.len(),
            },
        })?;

        let physical_tree = encode_type(ObjectType::Btree, StorageKind::Physical);
        if phys.tree_type != physical_tree {
            return Err(Error::MalformedTree(format!(
                "object map {address:#x} has tree type {:#010x}, expected a physical B-tree",
                phys.tree_type
            )));
        }
        if phys.snapshot_tree_oid != OID_INVALID && phys.snapshot_tree_type != physical_tree {
            return Err(Error::MalformedTree(format!(
                "object map {address:#x} has snapshot tree type {:#010x}",
                phys.snapshot_tree_type
            )));
        }

        tracing::debug!(
            "opened object map at {address:#x}: tree {:#x}, {} snapshots, flags {:?}",
            phys.tree_oid,
            phys.snap_count,
            phys.flags
        );

        Ok(Self {
            reader,
            config,
            address,
            phys,
        })
    }

    #[must_use]
    pub const fn address(&self) -> Paddr {
        self.address
    }

    /// The decoded `omap_phys_t`.
    #[must_use]
    pub const fn phys(&self) -> &OmapPhys {
        &self.phys
    }

    #[must_use]
    pub const fn flags(&self) -> OmapFlags {
        self.phys.flags
    }

    #[must_use]
    pub const fn config(&self) -> NavigatorConfig {
        self.config
    }

    #[must_use]
    pub const fn reader(&self) -> &'r dyn BlockReader {
        self.reader
    }

    /// Find the newest mapping for `oid` with `xid <= xid`.
    ///
    /// Returns `Ok(None)` if the map holds no such version. The entry is
    /// returned as stored, without validating its flags.
    pub fn lookup(&self, oid: Oid, xid: Xid) -> Result<Option<OmapMapping>, Error> {
        let resolver = ObjectResolver::physical(self.reader, self.config);
        let tree = BTree::open(&resolver, ChildRef::Direct(self.phys.tree_oid), &OmapKeys)?;
        if tree.config().space() != TreeSpace::Physical {
            return Err(Error::MalformedTree(format!(
                "object map tree {:#x} is not a physical tree",
                self.phys.tree_oid
            )));
        }

        let search = OmapKey { oid, xid }.to_bytes();
        let Some((key_bytes, value_bytes)) = tree.search_floor(&search)? else {
            return Ok(None);
        };
        let key = OmapKey::read(&key_bytes).ok_or_else(|| {
            Error::corrupt_mapping(oid, xid, format!("key is {} bytes", key_bytes.len()))
        })?;
        if key.oid != oid {
            return Ok(None);
        }
        let value = OmapValue::read(&value_bytes).ok_or_else(|| {
            Error::corrupt_mapping(oid, xid, format!("value is {} bytes", value_bytes.len()))
        })?;

        Ok(Some(OmapMapping { key, value }))
    }

    /// Resolve `oid` as of `xid` to the physical address of its block.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no version of `oid` exists at or before `xid`
    /// - `EncryptedObject` if the mapping marks the object encrypted
    /// - `CorruptMapping` if the stored entry is inconsistent
    pub fn resolve(&self, oid: Oid, xid: Xid) -> Result<Paddr, Error> {
        if oid == OID_INVALID {
            return Err(Error::NotFound { oid, xid });
        }
        let mapping = self.lookup(oid, xid)?.ok_or(Error::NotFound { oid, xid })?;
        let value = mapping.value;

        if value.flags.contains(OmapValueFlags::DELETED) {
            return Err(Error::corrupt_mapping(oid, xid, "mapping is deleted"));
        }
        if value.flags.contains(OmapValueFlags::ENCRYPTED) {
            return Err(Error::EncryptedObject { oid });
        }
        if value.flags.contains(OmapValueFlags::NOHEADER) {
            return Err(Error::corrupt_mapping(oid, xid, "object has no header"));
        }
        if value.paddr == 0 {
            return Err(Error::corrupt_mapping(oid, xid, "mapping has no address"));
        }
        let block_size = self.reader.block_size();
        let size = value.size as usize;
        if size == 0 || block_size == 0 || size % block_size != 0 {
            return Err(Error::corrupt_mapping(
                oid,
                xid,
                format!("size {size} is not a multiple of the {block_size}-byte block size"),
            ));
        }

        tracing::trace!(
            "resolved object {oid:#x} as of xid {xid} to {:#x} (written at xid {})",
            value.paddr,
            mapping.key.xid
        );
        Ok(value.paddr)
    }

    /// Look up the snapshot taken at `xid`.
    ///
    /// Returns `Ok(None)` if there is no such snapshot or the map has no
    /// snapshot tree.
    pub fn snapshot(&self, xid: Xid) -> Result<Option<OmapSnapshot>, Error> {
        if self.phys.snapshot_tree_oid == OID_INVALID {
            return Ok(None);
        }
        let resolver = ObjectResolver::physical(self.reader, self.config);
        let tree = BTree::open(
            &resolver,
            ChildRef::Direct(self.phys.snapshot_tree_oid),
            &U64Keys,
        )?;
        tree.search(&xid.to_le_bytes())?
            .map(|bytes| Self::decode_snapshot(xid, &bytes))
            .transpose()
    }

    /// Every snapshot, in xid order.
    pub fn snapshots(&self) -> Result<Vec<(Xid, OmapSnapshot)>, Error> {
        if self.phys.snapshot_tree_oid == OID_INVALID {
            return Ok(Vec::new());
        }
        let resolver = ObjectResolver::physical(self.reader, self.config);
        let tree = BTree::open(
            &resolver,
            ChildRef::Direct(self.phys.snapshot_tree_oid),
            &U64Keys,
        )?;

        let mut snapshots = Vec::new();
        for entry in tree.range(KeyRange::all()) {
            let (key, value) = entry?;
            let xid_bytes: [u8; 8] = key.as_slice().try_into().map_err(|_| {
                Error::MalformedTree(format!("snapshot key is {} bytes", key.len()))
            })?;
            let xid = Xid::from_le_bytes(xid_bytes);
            snapshots.push((xid, Self::decode_snapshot(xid, &value)?));
        }
        Ok(snapshots)
    }

    fn decode_snapshot(xid: Xid, bytes: &[u8]) -> Result<OmapSnapshot, Error> {
        OmapSnapshot::read(bytes).ok_or_else(|| {
            Error::MalformedTree(format!(
                "snapshot {xid} record is {} bytes, expected {}",
                bytes.len(),
                OmapSnapshot::SIZE
            ))
        })
    }
}
