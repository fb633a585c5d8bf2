//! Object headers and checksums.
//!
//! Every block the navigator trusts starts with an `obj_phys_t` header whose
//! checksum covers the rest of the block.

mod checksum;
mod header;

pub use checksum::{CHECKSUM_SIZE, ChecksumError, fletcher64, object_checksum, verify};
pub use header::{
    OBJECT_HEADER_SIZE, OID_INVALID, ObjectHeader, ObjectType, ObjectTypeFlags, Oid, Paddr,
    StorageKind, Xid, encode_type,
};
