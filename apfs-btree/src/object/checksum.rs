//! Fletcher-64 block checksums.
//!
//! The first 8 bytes of every object hold the checksum of the remaining
//! bytes, computed over little-endian 32-bit words modulo `2^32 - 1`.

use crate::bytes::read_u64;

/// Size of the stored checksum at the start of an object.
pub const CHECKSUM_SIZE: usize = 8;

const MODULUS: u64 = 0xffff_ffff;

/// Compute the Fletcher-64 checksum of `data`.
///
/// Returns `None` if `data` is not made of whole 32-bit words.
#[must_use]
pub fn fletcher64(data: &[u8]) -> Option<u64> {
    if data.len() % 4 != 0 {
        return None;
    }

    let mut sum1 = 0u64;
    let mut sum2 = 0u64;
    for word in data.chunks_exact(4) {
        let value = u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        sum1 = (sum1 + value) % MODULUS;
        sum2 = (sum2 + sum1) % MODULUS;
    }

    let check_low = MODULUS - ((sum1 + sum2) % MODULUS);
    let check_high = MODULUS - ((sum1 + check_low) % MODULUS);
    Some((check_high << 32) | check_low)
}

/// Checksum of an object block: everything after the stored checksum.
#[must_use]
pub fn object_checksum(block: &[u8]) -> Option<u64> {
    block.get(CHECKSUM_SIZE..).and_then(fletcher64)
}

/// Compare the stored checksum of `block` against a fresh computation.
pub fn verify(block: &[u8]) -> Result<(), ChecksumError> {
    if block.len() < CHECKSUM_SIZE {
        return Err(ChecksumError::InvalidLength(block.len()));
    }
    let computed = object_checksum(block).ok_or(ChecksumError::InvalidLength(block.len()))?;
    let stored = read_u64(block, 0);
    if stored == computed {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch { stored, computed })
    }
}

/// Errors from checksum validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumError {
    /// The block cannot be checksummed at this length.
    InvalidLength(usize),
    /// The stored checksum disagrees with the block contents.
    Mismatch { stored: u64, computed: u64 },
}

impl std::fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLength(len) => write!(f, "cannot checksum a {len}-byte block"),
            Self::Mismatch { stored, computed } => write!(
                f,
                "checksum mismatch: stored {stored:#018x}, computed {computed:#018x}"
            ),
        }
    }
}

impl std::error::Error for ChecksumError {}
