//! Crate-level error taxonomy.
//!
//! Every navigator operation returns [`Error`]. A key that is simply not in
//! a tree is `Ok(None)`, never an error; unreadable or inconsistent data
//! always is.

use crate::block::BlockError;
use crate::btree::NodeError;
use crate::object::{ChecksumError, Oid, Paddr, Xid};

/// Errors from decoding and navigating trees.
#[derive(Debug)]
pub enum Error {
    /// The block reader failed.
    Block { address: Paddr, source: BlockError },
    /// A block's stored checksum does not match its contents.
    ChecksumMismatch {
        address: Paddr,
        stored: u64,
        computed: u64,
    },
    /// A node's layout is inconsistent.
    MalformedNode { address: Paddr, reason: NodeError },
    /// Nodes are individually valid but do not form a consistent tree.
    MalformedTree(String),
    /// No object version satisfies the request.
    NotFound { oid: Oid, xid: Xid },
    /// A virtual reference was met with no object map to resolve it.
    UnsupportedKeySpace { oid: Oid },
    /// An object-map entry or the object it points at is inconsistent.
    CorruptMapping { oid: Oid, xid: Xid, reason: String },
    /// The object is encrypted; decryption is not supported.
    EncryptedObject { oid: Oid },
    /// A block holds a different kind of object than expected.
    UnexpectedObjectType {
        address: Paddr,
        expected: &'static str,
        found: u32,
    },
}

impl Error {
    /// Classify a node parse failure at `address`.
    ///
    /// Checksum failures and tree-level inconsistencies get their own
    /// variants; everything else is a malformed node.
    #[must_use]
    pub fn from_node(address: Paddr, reason: NodeError) -> Self {
        match reason {
            NodeError::Checksum(e) => Self::from_checksum(address, e),
            NodeError::MissingTreeInfo
            | NodeError::InvalidFixedSize
            | NodeError::InvalidTreeInfo(_) => {
                Self::MalformedTree(format!("node {address:#x}: {reason}"))
            }
            _ => Self::MalformedNode { address, reason },
        }
    }

    /// Classify a checksum failure at `address`.
    #[must_use]
    pub fn from_checksum(address: Paddr, error: ChecksumError) -> Self {
        match error {
            ChecksumError::Mismatch { stored, computed } => {
                tracing::warn!(
                    "checksum mismatch at block {address:#x}: stored {stored:#018x}, computed {computed:#018x}"
                );
                Self::ChecksumMismatch {
                    address,
                    stored,
                    computed,
                }
            }
            ChecksumError::InvalidLength(len) => Self::MalformedNode {
                address,
                reason: NodeError::InvalidBlockSize(len),
            },
        }
    }

    /// Build a `CorruptMapping` and log it.
    pub(crate) fn corrupt_mapping(oid: Oid, xid: Xid, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::warn!("corrupt mapping for object {oid:#x} xid {xid}: {reason}");
        Self::CorruptMapping { oid, xid, reason }
    }

    /// Returns true if the error means the data could not be trusted, as
    /// opposed to an object that does not exist.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::MalformedNode { .. }
                | Self::MalformedTree(_)
                | Self::CorruptMapping { .. }
                | Self::UnexpectedObjectType { .. }
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block { address, source } => {
                write!(f, "failed to read block {address:#x}: {source}")
            }
            Self::ChecksumMismatch {
                address,
                stored,
                computed,
            } => write!(
                f,
                "checksum mismatch at block {address:#x}: stored {stored:#018x}, computed {computed:#018x}"
            ),
            Self::MalformedNode { address, reason } => {
                write!(f, "malformed node at block {address:#x}: {reason}")
            }
            Self::MalformedTree(reason) => write!(f, "malformed tree: {reason}"),
            Self::NotFound { oid, xid } => {
                write!(f, "object {oid:#x} not found at or before xid {xid}")
            }
            Self::UnsupportedKeySpace { oid } => {
                write!(f, "virtual object {oid:#x} referenced without an object map")
            }
            Self::CorruptMapping { oid, xid, reason } => {
                write!(f, "corrupt mapping for object {oid:#x} xid {xid}: {reason}")
            }
            Self::EncryptedObject { oid } => write!(f, "object {oid:#x} is encrypted"),
            Self::UnexpectedObjectType {
                address,
                expected,
                found,
            } => write!(
                f,
                "block {address:#x} holds object type {found:#010x}, expected {expected}"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Block { source, .. } => Some(source),
            Self::MalformedNode { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
