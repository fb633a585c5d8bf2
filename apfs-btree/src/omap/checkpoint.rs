//! Checkpoint mappings for ephemeral objects.
//!
//! Ephemeral objects live in memory while a container is mounted and are
//! written to the checkpoint data area at each checkpoint. A run of
//! `checkpoint_map_phys_t` blocks records where each one landed; the last
//! block of the run carries `CHECKPOINT_MAP_LAST`.
//!
//! Layout:
//! - object header: 32 bytes
//! - `cpm_flags`: 4 bytes
//! - `cpm_count`: 4 bytes
//! - `cpm_map`: `cpm_count` 40-byte `checkpoint_mapping_t` entries

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use bitflags::bitflags;

use crate::block::{BlockError, BlockReader};
use crate::btree::ChildRef;
use crate::bytes::{read_u32, read_u64};
use crate::config::NavigatorConfig;
use crate::error::Error;
use crate::object::{OBJECT_HEADER_SIZE, OID_INVALID, ObjectHeader, ObjectType, Oid, Paddr};
use crate::omap::{ObjectBlock, ObjectResolver};

bitflags! {
    /// Checkpoint-map block flags (`cpm_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CheckpointMapFlags: u32 {
        const LAST = 0x0000_0001;
    }
}

/// One ephemeral object's location (`checkpoint_mapping_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMapping {
    /// Raw object type, as in `o_type`.
    pub object_type: u32,
    pub subtype: u32,
    /// Size of the object in bytes.
    pub size: u32,
    /// Volume the object belongs to, or 0 for container objects.
    pub fs_oid: Oid,
    pub oid: Oid,
    pub paddr: Paddr,
}

impl CheckpointMapping {
    pub const SIZE: usize = 40;

    const fn read(data: &[u8], offset: usize) -> Self {
        Self {
            object_type: read_u32(data, offset),
            subtype: read_u32(data, offset + 4),
            size: read_u32(data, offset + 8),
            fs_oid: read_u64(data, offset + 16),
            oid: read_u64(data, offset + 24),
            paddr: read_u64(data, offset + 32),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.object_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.subtype.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.fs_oid.to_le_bytes());
        buf[24..32].copy_from_slice(&self.oid.to_le_bytes());
        buf[32..40].copy_from_slice(&self.paddr.to_le_bytes());
        buf
    }
}

/// A decoded checkpoint-map block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMapBlock {
    pub header: ObjectHeader,
    pub flags: CheckpointMapFlags,
    pub mappings: Vec<CheckpointMapping>,
}

impl CheckpointMapBlock {
    /// Bytes before the first mapping.
    pub const HEADER_SIZE: usize = OBJECT_HEADER_SIZE + 8;

    /// Decode a block already read through a resolver.
    pub fn parse(block: &ObjectBlock) -> Result<Self, Error> {
        let address = block.address;
        if block.header.object_type() != Ok(ObjectType::CheckpointMap) {
            return Err(Error::UnexpectedObjectType {
                address,
                expected: "checkpoint map",
                found: block.header.type_and_flags,
            });
        }

        let data = &block.data;
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::Block {
                address,
                source: BlockError::ShortRead {
                    expected: Self::HEADER_SIZE,
                    actual: data.len(),
                },
            });
        }
        let flags = CheckpointMapFlags::from_bits_retain(read_u32(data, 32));
        let count = read_u32(data, 36) as usize;
        let capacity = data.len().saturating_sub(Self::HEADER_SIZE) / CheckpointMapping::SIZE;
        if count > capacity {
            return Err(Error::corrupt_mapping(
                address,
                block.header.xid,
                format!("checkpoint map holds {count} entries but has room for {capacity}"),
            ));
        }

        let mappings = (0..count)
            .map(|i| {
                let offset = Self::HEADER_SIZE + i * CheckpointMapping::SIZE;
                CheckpointMapping::read(data, offset)
            })
            .collect();

        Ok(Self {
            header: block.header,
            flags,
            mappings,
        })
    }

    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.flags.contains(CheckpointMapFlags::LAST)
    }
}

/// Ephemeral oid to physical address table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EphemeralMap {
    entries: HashMap<Oid, Paddr>,
}

impl EphemeralMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where `oid` lives.
    ///
    /// # Errors
    ///
    /// `CorruptMapping` if `oid` is 0 or already mapped.
    pub fn insert(&mut self, oid: Oid, paddr: Paddr) -> Result<(), Error> {
        if oid == OID_INVALID {
            return Err(Error::corrupt_mapping(oid, 0, "ephemeral oid is 0"));
        }
        match self.entries.entry(oid) {
            Entry::Occupied(entry) => Err(Error::corrupt_mapping(
                oid,
                0,
                format!(
                    "ephemeral object mapped twice ({:#x} and {paddr:#x})",
                    entry.get()
                ),
            )),
            Entry::Vacant(entry) => {
                entry.insert(paddr);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, oid: Oid) -> Option<Paddr> {
        self.entries.get(&oid).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load the mappings from a run of checkpoint-map blocks.
    ///
    /// Blocks are read in order until one carries `CHECKPOINT_MAP_LAST`.
    pub fn load(
        reader: &dyn BlockReader,
        config: NavigatorConfig,
        addresses: impl IntoIterator<Item = Paddr>,
    ) -> Result<Self, Error> {
        let resolver = ObjectResolver::physical(reader, config);
        let mut map = Self::new();
        let mut blocks = 0usize;

        for address in addresses {
            let block = resolver.read_child(ChildRef::Direct(address))?;
            let cpm = CheckpointMapBlock::parse(&block)?;
            blocks += 1;
            for mapping in &cpm.mappings {
                map.insert(mapping.oid, mapping.paddr)?;
            }
            if cpm.is_last() {
                tracing::debug!(
                    "loaded {} ephemeral mappings from {blocks} checkpoint map blocks",
                    map.len()
                );
                return Ok(map);
            }
        }

        tracing::warn!("checkpoint map run of {blocks} blocks has no last block");
        Ok(map)
    }
}
