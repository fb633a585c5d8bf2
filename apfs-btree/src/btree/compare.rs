//! Key ordering.
//!
//! The node layout is shared by every tree; only the key order differs.
//! A comparator is injected when a tree is opened.

use std::cmp::Ordering;

use crate::bytes::read_u64;

/// Total order over raw key bytes.
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> KeyComparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bytewise;

impl KeyComparator for Bytewise {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Keys that start with a little-endian `u64`, for trees flagged
/// `UINT64_KEYS`. Keys shorter than 8 bytes sort first by their bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Keys;

impl KeyComparator for U64Keys {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if a.len() < 8 || b.len() < 8 {
            return a.len().cmp(&b.len()).then_with(|| a.cmp(b));
        }
        read_u64(a, 0)
            .cmp(&read_u64(b, 0))
            .then_with(|| a[8..].cmp(&b[8..]))
    }
}

/// Object-map keys: `oid` then `xid`, both ascending.
#[derive(Debug, Clone, Copy, Default)]
pub struct OmapKeys;

impl KeyComparator for OmapKeys {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if a.len() < 16 || b.len() < 16 {
            return a.len().cmp(&b.len()).then_with(|| a.cmp(b));
        }
        read_u64(a, 0)
            .cmp(&read_u64(b, 0))
            .then_with(|| read_u64(a, 8).cmp(&read_u64(b, 8)))
    }
}
