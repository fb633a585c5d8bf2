//! Turning child references into validated blocks.
//!
//! # Address spaces
//!
//! - Physical: the reference is the block address and the header oid
//!   equals it
//! - Virtual: the reference is an oid, resolved through the object map as
//!   of the resolver's transaction
//! - Ephemeral: the reference is an oid, located through the checkpoint
//!   mapping (identity when no mapping is installed)

use crate::block::{BlockError, BlockReader};
use crate::btree::ChildRef;
use crate::config::NavigatorConfig;
use crate::error::Error;
use crate::object::{self, OID_INVALID, ObjectHeader, Oid, Paddr, StorageKind, Xid};
use crate::omap::{EphemeralMap, ObjectMap};

/// A block read through a resolver, checksummed and identity-checked.
#[derive(Debug, Clone)]
pub struct ObjectBlock {
    pub address: Paddr,
    pub header: ObjectHeader,
    pub data: Vec<u8>,
}

/// Resolves child references to blocks.
///
/// Cheap to clone; holds references to the reader and maps plus the
/// transaction used for virtual lookups.
#[derive(Clone)]
pub struct ObjectResolver<'r> {
    reader: &'r dyn BlockReader,
    omap: Option<ObjectMap<'r>>,
    ephemeral: Option<&'r EphemeralMap>,
    xid: Xid,
    config: NavigatorConfig,
}

impl std::fmt::Debug for ObjectResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectResolver")
            .field("omap", &self.omap)
            .field("ephemeral", &self.ephemeral.map(EphemeralMap::len))
            .field("xid", &self.xid)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'r> ObjectResolver<'r> {
    /// A resolver for physical and ephemeral trees only.
    ///
    /// Virtual references fail with `UnsupportedKeySpace`.
    #[must_use]
    pub const fn physical(reader: &'r dyn BlockReader, config: NavigatorConfig) -> Self {
        Self {
            reader,
            omap: None,
            ephemeral: None,
            xid: Xid::MAX,
            config,
        }
    }

    /// A resolver that maps virtual references through `omap` as of `xid`.
    #[must_use]
    pub fn with_object_map(omap: ObjectMap<'r>, xid: Xid) -> Self {
        Self {
            reader: omap.reader(),
            config: omap.config(),
            omap: Some(omap),
            ephemeral: None,
            xid,
        }
    }

    /// Locate ephemeral objects through `map` instead of by identity.
    #[must_use]
    pub const fn with_ephemeral_map(mut self, map: &'r EphemeralMap) -> Self {
        self.ephemeral = Some(map);
        self
    }

    /// The same resolver, viewing virtual objects as of `xid`.
    #[must_use]
    pub fn as_of(&self, xid: Xid) -> Self {
        Self {
            xid,
            ..self.clone()
        }
    }

    #[must_use]
    pub const fn reader(&self) -> &'r dyn BlockReader {
        self.reader
    }

    #[must_use]
    pub const fn config(&self) -> &NavigatorConfig {
        &self.config
    }

    /// Transaction used for virtual lookups.
    #[must_use]
    pub const fn xid(&self) -> Xid {
        self.xid
    }

    #[must_use]
    pub const fn object_map(&self) -> Option<&ObjectMap<'r>> {
        self.omap.as_ref()
    }

    /// Resolve a virtual object to its physical address.
    pub fn resolve(&self, oid: Oid, xid: Xid) -> Result<Paddr, Error> {
        let omap = self
            .omap
            .as_ref()
            .ok_or(Error::UnsupportedKeySpace { oid })?;
        omap.resolve(oid, xid)
    }

    /// Locate an ephemeral object.
    pub fn ephemeral_address(&self, oid: Oid) -> Result<Paddr, Error> {
        if oid == OID_INVALID {
            return Err(Error::NotFound { oid, xid: self.xid });
        }
        self.ephemeral.map_or(Ok(oid), |map| {
            map.get(oid).ok_or(Error::NotFound { oid, xid: self.xid })
        })
    }

    /// The physical address a reference points at.
    pub fn address_of(&self, child: ChildRef) -> Result<Paddr, Error> {
        match child {
            ChildRef::Direct(address) => Ok(address),
            ChildRef::Indirect(oid) => self.resolve(oid, self.xid),
        }
    }

    /// Read the block behind `child` without decoding it.
    ///
    /// The block must be exactly one reader block long.
    pub fn read_raw(&self, child: ChildRef) -> Result<(Paddr, Vec<u8>), Error> {
        let address = self.address_of(child)?;
        let data = self
            .reader
            .read_block(address)
            .map_err(|source| Error::Block { address, source })?;

        let expected = self.reader.block_size();
        if data.len() != expected {
            return Err(Error::Block {
                address,
                source: BlockError::ShortRead {
                    expected,
                    actual: data.len(),
                },
            });
        }
        Ok((address, data))
    }

    /// Check that a header is the object `child` asked for.
    ///
    /// - Direct: a physical object must carry its own address as oid
    /// - Indirect: the oid must match and the version must not be newer
    ///   than the resolver's transaction
    pub fn verify_identity(&self, child: ChildRef, header: &ObjectHeader) -> Result<(), Error> {
        match child {
            ChildRef::Direct(address) => {
                if header.storage() == StorageKind::Physical && header.oid != address {
                    return Err(Error::corrupt_mapping(
                        address,
                        header.xid,
                        format!("physical block {address:#x} holds object {:#x}", header.oid),
                    ));
                }
            }
            ChildRef::Indirect(oid) => {
                if header.oid != oid {
                    return Err(Error::corrupt_mapping(
                        oid,
                        self.xid,
                        format!("mapped block holds object {:#x}", header.oid),
                    ));
                }
                if header.xid > self.xid {
                    return Err(Error::corrupt_mapping(
                        oid,
                        self.xid,
                        format!("mapped block was written at xid {}", header.xid),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Read, checksum and identity-check the object behind `child`.
    pub fn read_child(&self, child: ChildRef) -> Result<ObjectBlock, Error> {
        let (address, data) = self.read_raw(child)?;
        if self.config.verify_checksums {
            object::verify(&data).map_err(|e| Error::from_checksum(address, e))?;
        }
        let header = ObjectHeader::read(&data).ok_or(Error::Block {
            address,
            source: BlockError::ShortRead {
                expected: object::OBJECT_HEADER_SIZE,
                actual: data.len(),
            },
        })?;
        self.verify_identity(child, &header)?;

        Ok(ObjectBlock {
            address,
            header,
            data,
        })
    }
}
