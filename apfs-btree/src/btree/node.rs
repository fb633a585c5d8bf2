//! B-tree node parsing and validation.
//!
//! Node layout (`btree_node_phys_t`):
//! - object header: 32 bytes
//! - `btn_flags`: 2 bytes
//! - `btn_level`: 2 bytes (0 = leaf)
//! - `btn_nkeys`: 4 bytes
//! - `btn_table_space`: 4 bytes (nloc)
//! - `btn_free_space`: 4 bytes (nloc)
//! - `btn_key_free_list`: 4 bytes (nloc)
//! - `btn_val_free_list`: 4 bytes (nloc)
//! - data area: table of contents, keys, free space, values
//!
//! Keys grow forward from the end of the table of contents. Values grow
//! backward from the end of the value area, which is the end of the block
//! or, for a root node, the start of the 40-byte tree-info trailer.
//!
//! A parsed [`Node`] owns its block and a slot table of absolute byte
//! ranges, so every `entry(i)` is bounds-safe after a successful parse.

use std::cmp::Ordering;
use std::ops::Range;

use bitflags::bitflags;

use crate::btree::compare::KeyComparator;
use crate::btree::info::{BTreeInfo, TreeConfig};
use crate::bytes::{read_u16, read_u32};
use crate::object::{self, ChecksumError, ObjectHeader, ObjectType, Paddr};

/// Size of the node header including the object header.
pub const NODE_HEADER_SIZE: usize = 56;

/// Largest node addressable with 16-bit offsets.
pub const MAX_NODE_SIZE: usize = 65536;

/// Offset sentinel meaning "no offset".
pub const BTOFF_INVALID: u16 = 0xffff;

/// Size of a variable-size table-of-contents entry (`kvloc_t`).
pub const KVLOC_SIZE: usize = 8;

/// Size of a fixed-size table-of-contents entry (`kvoff_t`).
pub const KVOFF_SIZE: usize = 4;

/// Size of a child reference stored as a non-leaf value.
pub const CHILD_REF_SIZE: usize = 8;

bitflags! {
    /// Node flags (`btn_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u16 {
        const ROOT = 0x0001;
        const LEAF = 0x0002;
        const FIXED_KV_SIZE = 0x0004;
        const CHECK_KOFF_INVAL = 0x8000;
    }
}

/// A location descriptor (`nloc_t`) into the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nloc {
    pub off: u16,
    pub len: u16,
}

impl Nloc {
    /// An empty descriptor with no offset.
    pub const INVALID: Self = Self {
        off: BTOFF_INVALID,
        len: 0,
    };

    const fn read(data: &[u8], offset: usize) -> Self {
        Self {
            off: read_u16(data, offset),
            len: read_u16(data, offset + 2),
        }
    }

    /// Serialize the descriptor.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        buf[0..2].copy_from_slice(&self.off.to_le_bytes());
        buf[2..4].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Returns true if the offset is the `0xffff` sentinel.
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.off == BTOFF_INVALID
    }
}

/// Structural errors found while parsing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    /// The block cannot hold a node of this size.
    InvalidBlockSize(usize),
    /// The stored checksum does not match the block.
    Checksum(ChecksumError),
    /// The object header does not describe a B-tree node.
    WrongObjectType(u32),
    /// The root flag disagrees with the object type.
    RootFlagMismatch,
    /// The leaf flag disagrees with the level.
    LevelFlagMismatch { level: u16, leaf: bool },
    /// A location descriptor points outside its region.
    DescriptorOutOfBounds { field: &'static str, off: u16, len: u16 },
    /// The table of contents cannot hold the declared key count.
    TocOverflow { key_count: u32, capacity: usize },
    /// A key range lies outside key storage.
    KeyOutOfBounds { index: usize },
    /// A value range lies outside the value area.
    ValueOutOfBounds { index: usize },
    /// A key offset is the invalid sentinel without `CHECK_KOFF_INVAL`.
    InvalidKeyOffset { index: usize },
    /// A ghost entry in a tree that does not allow ghosts.
    UnexpectedGhost { index: usize },
    /// A non-leaf value is not a child reference.
    InvalidChildRef { index: usize, len: usize },
    /// A non-leaf value references object 0.
    NullChildRef { index: usize },
    /// A non-leaf node has no entries to descend through.
    EmptyIndexNode,
    /// Slot keys are not in comparator order.
    OutOfOrder { index: usize },
    /// A fixed-size non-root node was parsed without tree metadata.
    MissingTreeInfo,
    /// Fixed-size mode with a zero or oversized key or value size.
    InvalidFixedSize,
    /// The tree-info trailer is inconsistent.
    InvalidTreeInfo(&'static str),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBlockSize(len) => write!(f, "invalid node size {len}"),
            Self::Checksum(e) => write!(f, "{e}"),
            Self::WrongObjectType(raw) => {
                write!(f, "object type {raw:#010x} is not a B-tree node")
            }
            Self::RootFlagMismatch => write!(f, "root flag disagrees with object type"),
            Self::LevelFlagMismatch { level, leaf } => {
                write!(f, "leaf flag {leaf} disagrees with level {level}")
            }
            Self::DescriptorOutOfBounds { field, off, len } => {
                write!(f, "{field} descriptor out of bounds (off {off}, len {len})")
            }
            Self::TocOverflow {
                key_count,
                capacity,
            } => write!(
                f,
                "table of contents holds {capacity} entries but node has {key_count} keys"
            ),
            Self::KeyOutOfBounds { index } => write!(f, "key {index} out of bounds"),
            Self::ValueOutOfBounds { index } => write!(f, "value {index} out of bounds"),
            Self::InvalidKeyOffset { index } => write!(f, "key {index} has no offset"),
            Self::UnexpectedGhost { index } => {
                write!(f, "entry {index} is a ghost but ghosts are not allowed")
            }
            Self::InvalidChildRef { index, len } => {
                write!(f, "child reference {index} is {len} bytes, expected 8")
            }
            Self::NullChildRef { index } => write!(f, "child reference {index} is null"),
            Self::EmptyIndexNode => write!(f, "non-leaf node has no entries"),
            Self::OutOfOrder { index } => write!(f, "key {index} is out of order"),
            Self::MissingTreeInfo => write!(f, "fixed-size node parsed without tree info"),
            Self::InvalidFixedSize => {
                write!(f, "fixed-size node without usable key and value sizes")
            }
            Self::InvalidTreeInfo(reason) => write!(f, "invalid tree info: {reason}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Checksum(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChecksumError> for NodeError {
    fn from(e: ChecksumError) -> Self {
        Self::Checksum(e)
    }
}

/// What the parser may assume about the node being decoded.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// Verify the stored checksum before reading any field.
    pub verify_checksum: bool,
    /// Tree-wide metadata from the root, for non-root nodes.
    pub tree: Option<&'a TreeConfig>,
}

impl<'a> ParseContext<'a> {
    /// Context for a root node, which carries its own tree metadata.
    #[must_use]
    pub const fn root(verify_checksum: bool) -> Self {
        Self {
            verify_checksum,
            tree: None,
        }
    }

    /// Context for a node below a root with known metadata.
    #[must_use]
    pub const fn child(verify_checksum: bool, tree: &'a TreeConfig) -> Self {
        Self {
            verify_checksum,
            tree: Some(tree),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    key: Range<usize>,
    value: Range<usize>,
    ghost: bool,
}

/// A parsed, validated B-tree node.
///
/// # Invariants
///
/// - The block passed header, descriptor and slot validation
/// - Every slot range lies inside `data`
/// - Slots appear in table-of-contents order
#[derive(Debug, Clone)]
pub struct Node {
    address: Paddr,
    data: Vec<u8>,
    header: ObjectHeader,
    flags: NodeFlags,
    level: u16,
    raw_key_count: u32,
    table_space: Nloc,
    free_space: Nloc,
    key_free_list: Nloc,
    value_free_list: Nloc,
    info: Option<BTreeInfo>,
    slots: Vec<Slot>,
}

/// Byte boundaries of the data area, all absolute.
struct Layout {
    toc: Range<usize>,
    keys: Range<usize>,
    values: Range<usize>,
}

impl Layout {
    /// Resolve the table-space and free-space descriptors into absolute
    /// ranges, checking that they lie inside the data area in order.
    const fn new(table: Nloc, free: Nloc, value_end: usize) -> Result<Self, NodeError> {
        let toc_start = NODE_HEADER_SIZE + table.off as usize;
        let toc_end = toc_start + table.len as usize;
        if toc_end > value_end {
            return Err(NodeError::DescriptorOutOfBounds {
                field: "table space",
                off: table.off,
                len: table.len,
            });
        }

        let free_start = toc_end + free.off as usize;
        let free_end = free_start + free.len as usize;
        if free_end > value_end {
            return Err(NodeError::DescriptorOutOfBounds {
                field: "free space",
                off: free.off,
                len: free.len,
            });
        }

        Ok(Self {
            toc: toc_start..toc_end,
            keys: toc_end..free_start,
            values: free_end..value_end,
        })
    }
}

/// How table-of-contents entries are decoded for one node.
struct SlotFormat {
    /// Key and value sizes for fixed-size nodes.
    fixed: Option<(u16, u16)>,
    is_leaf: bool,
    allow_ghosts: bool,
    check_koff: bool,
}

impl SlotFormat {
    const fn entry_size(&self) -> usize {
        if self.fixed.is_some() {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        }
    }

    fn read_slots(
        &self,
        data: &[u8],
        layout: &Layout,
        key_count: usize,
    ) -> Result<Vec<Slot>, NodeError> {
        let entry_size = self.entry_size();
        let value_end = layout.values.end;
        let mut slots = Vec::with_capacity(key_count);

        for index in 0..key_count {
            let at = layout.toc.start + index * entry_size;
            let (key_loc, value_loc) = match self.fixed {
                Some((key_size, value_size)) => (
                    Nloc {
                        off: read_u16(data, at),
                        len: key_size,
                    },
                    Nloc {
                        off: read_u16(data, at + 2),
                        len: value_size,
                    },
                ),
                None => (Nloc::read(data, at), Nloc::read(data, at + 4)),
            };

            if key_loc.is_invalid() {
                if self.check_koff {
                    continue;
                }
                return Err(NodeError::InvalidKeyOffset { index });
            }

            let key_start = layout.keys.start + key_loc.off as usize;
            let key_end = key_start + key_loc.len as usize;
            if key_end > layout.keys.end {
                return Err(NodeError::KeyOutOfBounds { index });
            }

            let (value, ghost) = if value_loc.is_invalid() {
                if !self.allow_ghosts || !self.is_leaf {
                    return Err(NodeError::UnexpectedGhost { index });
                }
                (value_end..value_end, true)
            } else {
                let off = value_loc.off as usize;
                let value_len = value_loc.len as usize;
                if off > layout.values.len() || value_len > off {
                    return Err(NodeError::ValueOutOfBounds { index });
                }
                if !self.is_leaf && value_len != CHILD_REF_SIZE {
                    return Err(NodeError::InvalidChildRef {
                        index,
                        len: value_len,
                    });
                }
                let start = value_end - off;
                (start..start + value_len, false)
            };

            slots.push(Slot {
                key: key_start..key_end,
                value,
                ghost,
            });
        }

        Ok(slots)
    }
}

/// The fixed node header fields, checked against each other.
struct HeaderFields {
    header: ObjectHeader,
    flags: NodeFlags,
    level: u16,
    raw_key_count: u32,
    info: Option<BTreeInfo>,
}

impl HeaderFields {
    /// Check the block size and checksum, then decode the object header,
    /// node flags and, for roots, the trailer.
    fn read(data: &[u8], verify_checksum: bool) -> Result<Self, NodeError> {
        let len = data.len();
        if len < NODE_HEADER_SIZE || len % 4 != 0 || len > MAX_NODE_SIZE {
            return Err(NodeError::InvalidBlockSize(len));
        }

        if verify_checksum {
            object::verify(data)?;
        }

        let header = ObjectHeader::read(data).ok_or(NodeError::InvalidBlockSize(len))?;
        let flags = NodeFlags::from_bits_retain(read_u16(data, 32));
        let level = read_u16(data, 34);
        let raw_key_count = read_u32(data, 36);

        let is_root = flags.contains(NodeFlags::ROOT);
        match header.object_type() {
            Ok(ObjectType::Btree) if is_root => {}
            Ok(ObjectType::BtreeNode) if !is_root => {}
            Ok(ObjectType::Btree | ObjectType::BtreeNode) => {
                return Err(NodeError::RootFlagMismatch);
            }
            _ => return Err(NodeError::WrongObjectType(header.type_and_flags)),
        }

        let is_leaf = flags.contains(NodeFlags::LEAF);
        if is_leaf != (level == 0) {
            return Err(NodeError::LevelFlagMismatch {
                level,
                leaf: is_leaf,
            });
        }

        let info = if is_root {
            if len < NODE_HEADER_SIZE + BTreeInfo::SIZE {
                return Err(NodeError::InvalidBlockSize(len));
            }
            BTreeInfo::read(data)
        } else {
            None
        };

        Ok(Self {
            header,
            flags,
            level,
            raw_key_count,
            info,
        })
    }
}

impl Node {
    /// Parse and validate a node block read from `address`.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Checksum` before looking at any other field if
    /// checksum verification is requested and fails. Every other
    /// structural violation is reported with the matching variant.
    pub fn parse(
        address: Paddr,
        data: Vec<u8>,
        ctx: &ParseContext<'_>,
    ) -> Result<Self, NodeError> {
        let HeaderFields {
            header,
            flags,
            level,
            raw_key_count,
            info,
        } = HeaderFields::read(&data, ctx.verify_checksum)?;
        let is_root = flags.contains(NodeFlags::ROOT);
        let is_leaf = flags.contains(NodeFlags::LEAF);

        let table_space = Nloc::read(&data, 40);
        let free_space = Nloc::read(&data, 44);
        let key_free_list = Nloc::read(&data, 48);
        let value_free_list = Nloc::read(&data, 52);

        let value_end = if is_root {
            data.len() - BTreeInfo::SIZE
        } else {
            data.len()
        };
        let layout = Layout::new(table_space, free_space, value_end)?;
        Self::check_free_list(
            "key free list",
            key_free_list,
            layout.keys.len(),
            |off| off < layout.keys.len(),
        )?;
        Self::check_free_list(
            "value free list",
            value_free_list,
            layout.values.len(),
            |off| off > 0 && off <= layout.values.len(),
        )?;

        // Own trailer first for roots; children use the root's metadata.
        let own_config = match info {
            Some(info) => Some(TreeConfig::from_info(info)?),
            None => None,
        };
        let tree = own_config.as_ref().or(ctx.tree);

        let format = SlotFormat {
            fixed: Self::fixed_sizes(flags, tree)?,
            is_leaf,
            allow_ghosts: tree.is_some_and(TreeConfig::allow_ghosts),
            check_koff: flags.contains(NodeFlags::CHECK_KOFF_INVAL),
        };
        let capacity = layout.toc.len() / format.entry_size();
        if raw_key_count as usize > capacity {
            return Err(NodeError::TocOverflow {
                key_count: raw_key_count,
                capacity,
            });
        }
        let slots = format.read_slots(&data, &layout, raw_key_count as usize)?;

        if !is_leaf && slots.is_empty() {
            return Err(NodeError::EmptyIndexNode);
        }

        Ok(Self {
            address,
            data,
            header,
            flags,
            level,
            raw_key_count,
            table_space,
            free_space,
            key_free_list,
            value_free_list,
            info,
            slots,
        })
    }

    /// Key and value sizes for a fixed-size node, or `None` for a variable
    /// one. Index nodes always hold 8-byte child references.
    fn fixed_sizes(
        flags: NodeFlags,
        tree: Option<&TreeConfig>,
    ) -> Result<Option<(u16, u16)>, NodeError> {
        if !flags.contains(NodeFlags::FIXED_KV_SIZE) {
            return Ok(None);
        }
        let tree = tree.ok_or(NodeError::MissingTreeInfo)?;
        let value_size = if flags.contains(NodeFlags::LEAF) {
            tree.value_size()
        } else {
            CHILD_REF_SIZE
        };
        if tree.key_size() == 0 || value_size == 0 {
            return Err(NodeError::InvalidFixedSize);
        }
        let key_size = u16::try_from(tree.key_size()).map_err(|_| NodeError::InvalidFixedSize)?;
        let value_size = u16::try_from(value_size).map_err(|_| NodeError::InvalidFixedSize)?;
        Ok(Some((key_size, value_size)))
    }

    /// A free-list head is either the sentinel or inside its own side, and
    /// the list cannot account for more bytes than that side holds.
    fn check_free_list(
        field: &'static str,
        list: Nloc,
        side_len: usize,
        head_in_side: impl Fn(usize) -> bool,
    ) -> Result<(), NodeError> {
        let head_ok = list.is_invalid() || head_in_side(list.off as usize);
        if !head_ok || list.len as usize > side_len {
            return Err(NodeError::DescriptorOutOfBounds {
                field,
                off: list.off,
                len: list.len,
            });
        }
        Ok(())
    }

    /// Address the node was read from.
    #[must_use]
    pub const fn address(&self) -> Paddr {
        self.address
    }

    #[must_use]
    pub const fn header(&self) -> &ObjectHeader {
        &self.header
    }

    #[must_use]
    pub const fn flags(&self) -> NodeFlags {
        self.flags
    }

    #[must_use]
    pub const fn level(&self) -> u16 {
        self.level
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.flags.contains(NodeFlags::LEAF)
    }

    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.flags.contains(NodeFlags::ROOT)
    }

    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        self.flags.contains(NodeFlags::FIXED_KV_SIZE)
    }

    /// Number of usable entries (entries with an invalid key offset are
    /// skipped when `CHECK_KOFF_INVAL` is set).
    #[must_use]
    pub const fn key_count(&self) -> usize {
        self.slots.len()
    }

    /// `btn_nkeys` as stored.
    #[must_use]
    pub const fn raw_key_count(&self) -> u32 {
        self.raw_key_count
    }

    /// The tree-info trailer, for root nodes.
    #[must_use]
    pub const fn tree_info(&self) -> Option<&BTreeInfo> {
        self.info.as_ref()
    }

    #[must_use]
    pub const fn table_space(&self) -> Nloc {
        self.table_space
    }

    /// Free space between key storage and the value area.
    #[must_use]
    pub const fn free_space(&self) -> Nloc {
        self.free_space
    }

    #[must_use]
    pub const fn key_free_list(&self) -> Nloc {
        self.key_free_list
    }

    #[must_use]
    pub const fn value_free_list(&self) -> Nloc {
        self.value_free_list
    }

    /// Number of table-of-contents entries the node has room for.
    #[must_use]
    pub const fn toc_capacity(&self) -> usize {
        let entry_size = if self.is_fixed() {
            KVOFF_SIZE
        } else {
            KVLOC_SIZE
        };
        self.table_space.len as usize / entry_size
    }

    /// The raw block the node was parsed from.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Key and value bytes of entry `index`.
    ///
    /// A ghost entry has an empty value.
    #[must_use]
    pub fn entry(&self, index: usize) -> Option<(&[u8], &[u8])> {
        let slot = self.slots.get(index)?;
        Some((&self.data[slot.key.clone()], &self.data[slot.value.clone()]))
    }

    /// Key bytes of entry `index`.
    #[must_use]
    pub fn key(&self, index: usize) -> Option<&[u8]> {
        self.slots.get(index).map(|slot| &self.data[slot.key.clone()])
    }

    /// Returns true if entry `index` is a ghost.
    #[must_use]
    pub fn is_ghost(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|slot| slot.ghost)
    }

    /// Decode the child reference stored in non-leaf entry `index`.
    #[must_use]
    pub fn child_ref(&self, index: usize) -> Option<u64> {
        if self.is_leaf() {
            return None;
        }
        let (_, value) = self.entry(index)?;
        let bytes: [u8; CHILD_REF_SIZE] = value.try_into().ok()?;
        Some(u64::from_le_bytes(bytes))
    }

    /// Index of an entry whose key equals `key`.
    #[must_use]
    pub fn find(&self, key: &[u8], cmp: &dyn KeyComparator) -> Option<usize> {
        let index = self.lower_bound(key, cmp);
        let found = self.key(index)?;
        (cmp.compare(found, key) == Ordering::Equal).then_some(index)
    }

    /// Index of the last entry whose key is `<= key`.
    #[must_use]
    pub fn floor_index(&self, key: &[u8], cmp: &dyn KeyComparator) -> Option<usize> {
        self.upper_bound(key, cmp).checked_sub(1)
    }

    /// Index of the first entry whose key is `>= key`.
    #[must_use]
    pub fn lower_bound(&self, key: &[u8], cmp: &dyn KeyComparator) -> usize {
        self.slots.partition_point(|slot| {
            cmp.compare(&self.data[slot.key.clone()], key) == Ordering::Less
        })
    }

    /// Index of the first entry whose key is `> key`.
    #[must_use]
    pub fn upper_bound(&self, key: &[u8], cmp: &dyn KeyComparator) -> usize {
        self.slots.partition_point(|slot| {
            cmp.compare(&self.data[slot.key.clone()], key) != Ordering::Greater
        })
    }

    /// Check that entries are sorted by `cmp`.
    ///
    /// Equal neighbours are accepted only when `allow_duplicates` is set.
    pub fn check_order(
        &self,
        cmp: &dyn KeyComparator,
        allow_duplicates: bool,
    ) -> Result<(), NodeError> {
        for index in 1..self.slots.len() {
            let prev = &self.data[self.slots[index - 1].key.clone()];
            let next = &self.data[self.slots[index].key.clone()];
            match cmp.compare(prev, next) {
                Ordering::Less => {}
                Ordering::Equal if allow_duplicates => {}
                _ => return Err(NodeError::OutOfOrder { index }),
            }
        }
        Ok(())
    }
}
