//! The `obj_phys_t` header shared by every checksummed object.
//!
//! Layout (32 bytes):
//! - `checksum`: 8 bytes (Fletcher-64 of the rest of the block)
//! - `oid`: 8 bytes
//! - `xid`: 8 bytes
//! - `type`: 4 bytes (low 16 bits object type, high 16 bits storage + flags)
//! - `subtype`: 4 bytes

use bitflags::bitflags;

use crate::bytes::{read_u32, read_u64};

/// An object identifier.
///
/// For a physical object the identifier is its block address; ephemeral and
/// virtual objects carry a plain number.
pub type Oid = u64;

/// A transaction identifier. Monotonically increasing across checkpoints.
pub type Xid = u64;

/// A physical block address.
pub type Paddr = u64;

/// The reserved "no object" identifier.
pub const OID_INVALID: Oid = 0;

/// Size of the object header in bytes.
pub const OBJECT_HEADER_SIZE: usize = 32;

const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;
const OBJ_STORAGETYPE_MASK: u32 = 0xc000_0000;
const OBJ_EPHEMERAL: u32 = 0x8000_0000;
const OBJ_PHYSICAL: u32 = 0x4000_0000;

/// Object types stored in the low 16 bits of `o_type` and in `o_subtype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ObjectType {
    Invalid = 0x00,
    NxSuperblock = 0x01,
    Btree = 0x02,
    BtreeNode = 0x03,
    Spaceman = 0x05,
    SpacemanCab = 0x06,
    SpacemanCib = 0x07,
    SpacemanBitmap = 0x08,
    SpacemanFreeQueue = 0x09,
    ExtentListTree = 0x0a,
    Omap = 0x0b,
    CheckpointMap = 0x0c,
    Fs = 0x0d,
    FsTree = 0x0e,
    BlockRefTree = 0x0f,
    SnapMetaTree = 0x10,
    NxReaper = 0x11,
    NxReapList = 0x12,
    OmapSnapshot = 0x13,
    EfiJumpstart = 0x14,
    FusionMiddleTree = 0x15,
    NxFusionWbc = 0x16,
    NxFusionWbcList = 0x17,
    ErState = 0x18,
    Gbitmap = 0x19,
    GbitmapTree = 0x1a,
    GbitmapBlock = 0x1b,
    ErRecoveryBlock = 0x1c,
    SnapMetaExt = 0x1d,
    IntegrityMeta = 0x1e,
    FextTree = 0x1f,
    Reserved20 = 0x20,
    Test = 0xff,
}

impl TryFrom<u16> for ObjectType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let object_type = match value {
            0x00 => Self::Invalid,
            0x01 => Self::NxSuperblock,
            0x02 => Self::Btree,
            0x03 => Self::BtreeNode,
            0x05 => Self::Spaceman,
            0x06 => Self::SpacemanCab,
            0x07 => Self::SpacemanCib,
            0x08 => Self::SpacemanBitmap,
            0x09 => Self::SpacemanFreeQueue,
            0x0a => Self::ExtentListTree,
            0x0b => Self::Omap,
            0x0c => Self::CheckpointMap,
            0x0d => Self::Fs,
            0x0e => Self::FsTree,
            0x0f => Self::BlockRefTree,
            0x10 => Self::SnapMetaTree,
            0x11 => Self::NxReaper,
            0x12 => Self::NxReapList,
            0x13 => Self::OmapSnapshot,
            0x14 => Self::EfiJumpstart,
            0x15 => Self::FusionMiddleTree,
            0x16 => Self::NxFusionWbc,
            0x17 => Self::NxFusionWbcList,
            0x18 => Self::ErState,
            0x19 => Self::Gbitmap,
            0x1a => Self::GbitmapTree,
            0x1b => Self::GbitmapBlock,
            0x1c => Self::ErRecoveryBlock,
            0x1d => Self::SnapMetaExt,
            0x1e => Self::IntegrityMeta,
            0x1f => Self::FextTree,
            0x20 => Self::Reserved20,
            0xff => Self::Test,
            _ => return Err(value),
        };
        Ok(object_type)
    }
}

/// Where an object lives, from the high bits of `o_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Addressed by oid through an object map.
    Virtual,
    /// Lives in memory; located on disk through the checkpoint mapping.
    Ephemeral,
    /// The oid is the block address.
    Physical,
}

bitflags! {
    /// Flags in the high bits of `o_type`, excluding the storage kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectTypeFlags: u32 {
        const NOHEADER = 0x2000_0000;
        const ENCRYPTED = 0x1000_0000;
        const NONPERSISTENT = 0x0800_0000;
    }
}

/// A decoded object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Stored Fletcher-64 checksum.
    pub checksum: u64,
    pub oid: Oid,
    /// Transaction at which this version of the object was written.
    pub xid: Xid,
    /// Raw `o_type` (type code plus storage and flag bits).
    pub type_and_flags: u32,
    /// Raw `o_subtype`.
    pub subtype: u32,
}

impl ObjectHeader {
    /// Read a header from the start of a block.
    ///
    /// Returns `None` if the block is shorter than a header. The checksum is
    /// not verified here.
    #[must_use]
    pub const fn read(block: &[u8]) -> Option<Self> {
        if block.len() < OBJECT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            checksum: read_u64(block, 0),
            oid: read_u64(block, 8),
            xid: read_u64(block, 16),
            type_and_flags: read_u32(block, 24),
            subtype: read_u32(block, 28),
        })
    }

    /// Serialize the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; OBJECT_HEADER_SIZE] {
        let mut buf = [0u8; OBJECT_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.oid.to_le_bytes());
        buf[16..24].copy_from_slice(&self.xid.to_le_bytes());
        buf[24..28].copy_from_slice(&self.type_and_flags.to_le_bytes());
        buf[28..32].copy_from_slice(&self.subtype.to_le_bytes());
        buf
    }

    /// The raw 16-bit type code.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked to 16 bits
    pub const fn type_code(&self) -> u16 {
        (self.type_and_flags & OBJECT_TYPE_MASK) as u16
    }

    /// The decoded object type, or the raw code if unknown.
    pub fn object_type(&self) -> Result<ObjectType, u16> {
        ObjectType::try_from(self.type_code())
    }

    /// The decoded subtype, or the raw code if unknown.
    #[allow(clippy::cast_possible_truncation)] // masked to 16 bits
    pub fn subtype(&self) -> Result<ObjectType, u16> {
        ObjectType::try_from((self.subtype & OBJECT_TYPE_MASK) as u16)
    }

    /// Storage kind encoded in the type field.
    #[must_use]
    pub const fn storage(&self) -> StorageKind {
        match self.type_and_flags & OBJ_STORAGETYPE_MASK {
            OBJ_EPHEMERAL => StorageKind::Ephemeral,
            OBJ_PHYSICAL => StorageKind::Physical,
            _ => StorageKind::Virtual,
        }
    }

    /// Type flags other than the storage kind.
    #[must_use]
    pub const fn flags(&self) -> ObjectTypeFlags {
        ObjectTypeFlags::from_bits_truncate(self.type_and_flags)
    }
}

/// Encode a type code with its storage kind, as stored in `o_type`.
#[must_use]
pub const fn encode_type(object_type: ObjectType, storage: StorageKind) -> u32 {
    let storage_bits = match storage {
        StorageKind::Virtual => 0,
        StorageKind::Ephemeral => OBJ_EPHEMERAL,
        StorageKind::Physical => OBJ_PHYSICAL,
    };
    storage_bits | object_type as u32
}
