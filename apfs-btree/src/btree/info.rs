//! Tree-wide metadata stored in the root node trailer.
//!
//! Layout (`btree_info_t`, 40 bytes at the end of the root block):
//! - `flags`: 4 bytes
//! - `node_size`: 4 bytes
//! - `key_size`: 4 bytes (0 for variable-size keys)
//! - `val_size`: 4 bytes (0 for variable-size values)
//! - `longest_key`: 4 bytes
//! - `longest_val`: 4 bytes
//! - `key_count`: 8 bytes
//! - `node_count`: 8 bytes

use bitflags::bitflags;

use crate::btree::node::{MAX_NODE_SIZE, NODE_HEADER_SIZE, NodeError};
use crate::bytes::{read_u32, read_u64};

bitflags! {
    /// Tree flags (`bt_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TreeFlags: u32 {
        const UINT64_KEYS = 0x0000_0001;
        const SEQUENTIAL_INSERT = 0x0000_0002;
        const ALLOW_GHOSTS = 0x0000_0004;
        const EPHEMERAL = 0x0000_0008;
        const PHYSICAL = 0x0000_0010;
        const NONPERSISTENT = 0x0000_0020;
        const KV_NONALIGNED = 0x0000_0040;
    }
}

/// Default node size.
pub const BTREE_NODE_SIZE_DEFAULT: usize = 4096;
/// Minimum number of entries a non-root node is built with.
pub const BTREE_NODE_MIN_ENTRY_COUNT: usize = 4;
/// Table-of-contents capacity grows in steps of this many entries.
pub const BTREE_TOC_ENTRY_INCREMENT: usize = 8;
/// Most unused table-of-contents entries a node keeps before shrinking.
pub const BTREE_TOC_ENTRY_MAX_UNUSED: usize = 2 * BTREE_TOC_ENTRY_INCREMENT;

/// The decoded `btree_info_t` trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeInfo {
    pub flags: TreeFlags,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BTreeInfo {
    /// Size of the trailer in bytes.
    pub const SIZE: usize = 40;

    /// Read the trailer from the last 40 bytes of a root block.
    ///
    /// Returns `None` if the block is too short to hold one.
    #[must_use]
    pub fn read(block: &[u8]) -> Option<Self> {
        let offset = block.len().checked_sub(Self::SIZE)?;
        Some(Self {
            flags: TreeFlags::from_bits_retain(read_u32(block, offset)),
            node_size: read_u32(block, offset + 4),
            key_size: read_u32(block, offset + 8),
            val_size: read_u32(block, offset + 12),
            longest_key: read_u32(block, offset + 16),
            longest_val: read_u32(block, offset + 20),
            key_count: read_u64(block, offset + 24),
            node_count: read_u64(block, offset + 32),
        })
    }

    /// Serialize the trailer.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[4..8].copy_from_slice(&self.node_size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.key_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.val_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.longest_key.to_le_bytes());
        buf[20..24].copy_from_slice(&self.longest_val.to_le_bytes());
        buf[24..32].copy_from_slice(&self.key_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.node_count.to_le_bytes());
        buf
    }
}

/// How non-leaf values locate child nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeSpace {
    /// Child values are object ids resolved through the object map.
    Virtual,
    /// Child values are physical block addresses.
    Physical,
    /// Child values are ephemeral object ids resolved through the
    /// checkpoint mapping.
    Ephemeral,
}

/// Tree-wide configuration derived from the root trailer.
///
/// Built once when a tree is opened and passed to every child parse.
///
/// # Invariants
///
/// - At most one of `EPHEMERAL` and `PHYSICAL` is set
/// - `node_size` can hold a node header plus the trailer and fits 16-bit offsets
/// - Fixed key and value sizes fit in the data area of a root node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    info: BTreeInfo,
    space: TreeSpace,
}

impl TreeConfig {
    /// Validate a trailer and derive the tree configuration.
    pub const fn from_info(info: BTreeInfo) -> Result<Self, NodeError> {
        let space = match (
            info.flags.contains(TreeFlags::EPHEMERAL),
            info.flags.contains(TreeFlags::PHYSICAL),
        ) {
            (false, false) => TreeSpace::Virtual,
            (false, true) => TreeSpace::Physical,
            (true, false) => TreeSpace::Ephemeral,
            (true, true) => {
                return Err(NodeError::InvalidTreeInfo(
                    "tree is flagged both ephemeral and physical",
                ));
            }
        };

        let node_size = info.node_size as usize;
        if node_size < NODE_HEADER_SIZE + BTreeInfo::SIZE || node_size > MAX_NODE_SIZE {
            return Err(NodeError::InvalidTreeInfo("node size out of range"));
        }

        // A fixed entry must fit in the data area of a root node.
        let data_area = node_size - NODE_HEADER_SIZE - BTreeInfo::SIZE;
        if info.key_size as usize > data_area {
            return Err(NodeError::InvalidTreeInfo("key size larger than a node"));
        }
        if info.val_size as usize > data_area {
            return Err(NodeError::InvalidTreeInfo("value size larger than a node"));
        }

        Ok(Self { info, space })
    }

    /// The raw trailer.
    #[must_use]
    pub const fn info(&self) -> &BTreeInfo {
        &self.info
    }

    #[must_use]
    pub const fn space(&self) -> TreeSpace {
        self.space
    }

    #[must_use]
    pub const fn flags(&self) -> TreeFlags {
        self.info.flags
    }

    #[must_use]
    pub const fn node_size(&self) -> usize {
        self.info.node_size as usize
    }

    /// Fixed key size, or 0 for variable-size keys.
    #[must_use]
    pub const fn key_size(&self) -> usize {
        self.info.key_size as usize
    }

    /// Fixed leaf value size, or 0 for variable-size values.
    #[must_use]
    pub const fn value_size(&self) -> usize {
        self.info.val_size as usize
    }

    #[must_use]
    pub const fn allow_ghosts(&self) -> bool {
        self.info.flags.contains(TreeFlags::ALLOW_GHOSTS)
    }

    #[must_use]
    pub const fn uint64_keys(&self) -> bool {
        self.info.flags.contains(TreeFlags::UINT64_KEYS)
    }

    /// Nodes of a non-persistent tree are never written with checksums.
    #[must_use]
    pub const fn non_persistent(&self) -> bool {
        self.info.flags.contains(TreeFlags::NONPERSISTENT)
    }

    /// Whether keys and values are 8-byte aligned. Recorded, not enforced.
    #[must_use]
    pub const fn aligned(&self) -> bool {
        !self.info.flags.contains(TreeFlags::KV_NONALIGNED)
    }
}
