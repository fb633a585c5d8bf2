//! Block I/O abstraction.
//!
//! The navigator never touches a device directly. It asks a [`BlockReader`]
//! for whole blocks by physical address, so embedders can put a file, a disk
//! image or a cache behind it and tests can use the in-memory
//! [`MemoryBlockStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::Paddr;

/// Errors that can occur while reading a block.
#[derive(Debug)]
pub enum BlockError {
    /// I/O error from the underlying device.
    Io(std::io::Error),
    /// Nothing is stored at the address.
    Unmapped(Paddr),
    /// The device returned fewer bytes than a block.
    ShortRead { expected: usize, actual: usize },
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Unmapped(address) => write!(f, "no block at address {address:#x}"),
            Self::ShortRead { expected, actual } => {
                write!(f, "short read: expected {expected} bytes, got {actual}")
            }
        }
    }
}

impl std::error::Error for BlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlockError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Source of fixed-size blocks addressed by physical block number.
///
/// # Invariants
///
/// - Every successful `read_block` returns exactly `block_size()` bytes
/// - Reads have no side effects visible to the navigator
pub trait BlockReader: Send + Sync {
    /// Size of every block in bytes.
    fn block_size(&self) -> usize;

    /// Read the block at `address`, including its stored checksum.
    fn read_block(&self, address: Paddr) -> Result<Vec<u8>, BlockError>;
}

impl<R: BlockReader + ?Sized> BlockReader for &R {
    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn read_block(&self, address: Paddr) -> Result<Vec<u8>, BlockError> {
        (**self).read_block(address)
    }
}

/// In-memory block store.
///
/// Blocks are kept in a map keyed by address. Every read is counted so tests
/// can check how much I/O a traversal performs.
#[derive(Debug)]
pub struct MemoryBlockStore {
    block_size: usize,
    blocks: HashMap<Paddr, Vec<u8>>,
    reads: AtomicU64,
}

impl MemoryBlockStore {
    /// Create an empty store of `block_size`-byte blocks.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
            reads: AtomicU64::new(0),
        }
    }

    /// Store a block at `address`, replacing any previous contents.
    ///
    /// # Pre-conditions
    ///
    /// - `data.len() == block_size()`
    pub fn insert(&mut self, address: Paddr, data: Vec<u8>) {
        debug_assert_eq!(data.len(), self.block_size, "block size mismatch");
        self.blocks.insert(address, data);
    }

    /// Remove the block at `address`.
    pub fn remove(&mut self, address: Paddr) -> Option<Vec<u8>> {
        self.blocks.remove(&address)
    }

    /// XOR one byte of a stored block without touching its checksum.
    ///
    /// Returns `false` if there is no block at `address` or `offset` is out
    /// of range.
    pub fn corrupt_byte(&mut self, address: Paddr, offset: usize, mask: u8) -> bool {
        let Some(byte) = self
            .blocks
            .get_mut(&address)
            .and_then(|block| block.get_mut(offset))
        else {
            return false;
        };
        *byte ^= mask;
        true
    }

    /// Number of stored blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if no blocks are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of `read_block` calls so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Reset the read counter.
    pub fn reset_reads(&self) {
        self.reads.store(0, Ordering::Relaxed);
    }
}

impl BlockReader for MemoryBlockStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, address: Paddr) -> Result<Vec<u8>, BlockError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let block = self
            .blocks
            .get(&address)
            .ok_or(BlockError::Unmapped(address))?;
        if block.len() != self.block_size {
            return Err(BlockError::ShortRead {
                expected: self.block_size,
                actual: block.len(),
            });
        }
        Ok(block.clone())
    }
}
