//! Ordered iteration over a key range.
//!
//! The iterator seeks to the start bound once and then walks leaves left to
//! right with an explicit stack of `(node, next slot)` frames, so each node
//! below the root is read at most once per pass.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::iter::FusedIterator;
use std::ops::Bound;

use crate::btree::compare::KeyComparator;
use crate::btree::node::Node;
use crate::btree::tree::BTree;
use crate::error::Error;

/// A range of keys with owned bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Every key.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    #[must_use]
    pub const fn new(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self { start, end }
    }

    /// Keys in `start..=end`.
    #[must_use]
    pub fn inclusive(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Included(end.into()),
        }
    }

    /// Keys `>= start`.
    #[must_use]
    pub fn starting_at(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Unbounded,
        }
    }

    /// Returns true if `key` lies beyond the end bound.
    fn is_past_end(&self, key: &[u8], cmp: &dyn KeyComparator) -> bool {
        match &self.end {
            Bound::Unbounded => false,
            Bound::Included(end) => cmp.compare(key, end) == Ordering::Greater,
            Bound::Excluded(end) => cmp.compare(key, end) != Ordering::Less,
        }
    }
}

struct Frame<'a> {
    node: Cow<'a, Node>,
    next: usize,
}

/// Lazy in-order iterator over `(key, value)` pairs.
///
/// Yields `Err` at most once; the iterator is fused afterwards.
pub struct TreeIter<'a> {
    tree: &'a BTree<'a>,
    range: KeyRange,
    stack: Vec<Frame<'a>>,
    started: bool,
    done: bool,
}

impl<'a> TreeIter<'a> {
    pub(crate) const fn new(tree: &'a BTree<'a>, range: KeyRange) -> Self {
        Self {
            tree,
            range,
            stack: Vec::new(),
            started: false,
            done: false,
        }
    }

    /// Descend from the root to the first leaf slot inside the start bound.
    fn seek(&mut self) -> Result<(), Error> {
        let cmp = self.tree.comparator();
        let mut node: Cow<'a, Node> = Cow::Borrowed(self.tree.root());

        loop {
            if node.is_leaf() {
                let next = match &self.range.start {
                    Bound::Unbounded => 0,
                    Bound::Included(start) => node.lower_bound(start, cmp),
                    Bound::Excluded(start) => node.upper_bound(start, cmp),
                };
                self.stack.push(Frame { node, next });
                return Ok(());
            }

            let index = match &self.range.start {
                Bound::Unbounded => 0,
                Bound::Included(start) | Bound::Excluded(start) => {
                    node.floor_index(start, cmp).unwrap_or(0)
                }
            };
            let child = self.tree.read_child(&node, index)?;
            self.stack.push(Frame {
                node,
                next: index + 1,
            });
            node = Cow::Owned(child);
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        if !self.started {
            self.started = true;
            self.seek()?;
        }

        let cmp = self.tree.comparator();
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let index = frame.next;
            let Some((key, value)) = frame.node.entry(index) else {
                self.stack.pop();
                continue;
            };
            frame.next += 1;

            // Every key under a separator is at least the separator, so a
            // separator past the end closes the range.
            if self.range.is_past_end(key, cmp) {
                self.stack.clear();
                return Ok(None);
            }

            if frame.node.is_leaf() {
                return Ok(Some((key.to_vec(), value.to_vec())));
            }

            let child = self.tree.read_child(&frame.node, index)?;
            self.stack.push(Frame {
                node: Cow::Owned(child),
                next: 0,
            });
        }
    }
}

impl Iterator for TreeIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for TreeIter<'_> {}
