//! Tree navigation: point lookups from a root down to a leaf.
//!
//! A [`BTree`] keeps its decoded root in memory and reads every other node
//! through an [`ObjectResolver`] on demand. Nothing is cached between
//! calls, so each search costs one block read per level below the root.

use std::borrow::Cow;

use crate::btree::compare::KeyComparator;
use crate::btree::info::{TreeConfig, TreeSpace};
use crate::btree::iter::{KeyRange, TreeIter};
use crate::btree::node::{Node, NodeError, ParseContext};
use crate::error::Error;
use crate::object::{Oid, Paddr};
use crate::omap::ObjectResolver;

/// Where a child node lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRef {
    /// A physical block address.
    Direct(Paddr),
    /// A virtual object id, resolved through the object map.
    Indirect(Oid),
}

impl ChildRef {
    /// The raw identifier carried by the reference.
    #[must_use]
    pub const fn id(self) -> u64 {
        match self {
            Self::Direct(id) | Self::Indirect(id) => id,
        }
    }
}

/// A read-only B-tree.
///
/// # Invariants
///
/// - `root` carries the root flag and a valid tree-info trailer
/// - `root.level()` is within the configured maximum depth
/// - `config` is derived from `root` and never changes
pub struct BTree<'t> {
    resolver: &'t ObjectResolver<'t>,
    comparator: &'t dyn KeyComparator,
    root: Node,
    config: TreeConfig,
}

impl std::fmt::Debug for BTree<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("root", &self.root.address())
            .field("level", &self.root.level())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'t> BTree<'t> {
    /// Open the tree whose root node is at `root`.
    ///
    /// The root block is read, checksummed and validated, and the tree-wide
    /// configuration is derived from its trailer.
    pub fn open(
        resolver: &'t ObjectResolver<'t>,
        root: ChildRef,
        comparator: &'t dyn KeyComparator,
    ) -> Result<Self, Error> {
        let (address, data) = resolver.read_raw(root)?;
        let ctx = ParseContext::root(resolver.config().verify_checksums);
        let node = Node::parse(address, data, &ctx).map_err(|e| Error::from_node(address, e))?;
        resolver.verify_identity(root, node.header())?;

        Self::from_root_node(resolver, node, comparator)
    }

    /// Build a tree around an already decoded root node.
    pub fn from_root_node(
        resolver: &'t ObjectResolver<'t>,
        root: Node,
        comparator: &'t dyn KeyComparator,
    ) -> Result<Self, Error> {
        let address = root.address();
        if !root.is_root() {
            return Err(Error::MalformedTree(format!(
                "node {address:#x} is not a root node"
            )));
        }
        let info = root.tree_info().copied().ok_or_else(|| {
            Error::MalformedTree(format!("root {address:#x} has no tree info"))
        })?;
        let config = TreeConfig::from_info(info).map_err(|e| Error::from_node(address, e))?;

        let max_depth = resolver.config().max_depth;
        if root.level() > max_depth {
            return Err(Error::MalformedTree(format!(
                "root {address:#x} has level {}, deeper than the limit of {max_depth}",
                root.level()
            )));
        }
        if u64::from(root.level()) >= info.node_count.max(1) {
            return Err(Error::MalformedTree(format!(
                "root {address:#x} has level {} but the tree holds {} nodes",
                root.level(),
                info.node_count
            )));
        }
        if root.as_bytes().len() != config.node_size() {
            return Err(Error::MalformedTree(format!(
                "root {address:#x} is {} bytes but the tree declares {}-byte nodes",
                root.as_bytes().len(),
                config.node_size()
            )));
        }
        root.check_order(comparator, config.allow_ghosts())
            .map_err(|e| Error::from_node(address, e))?;

        tracing::debug!(
            "opened tree at {address:#x}: level {}, {} keys, {} nodes, {:?} space",
            root.level(),
            info.key_count,
            info.node_count,
            config.space()
        );

        Ok(Self {
            resolver,
            comparator,
            root,
            config,
        })
    }

    /// Tree-wide configuration from the root trailer.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The decoded root node.
    #[must_use]
    pub const fn root(&self) -> &Node {
        &self.root
    }

    /// Number of levels, counting the root and the leaves.
    #[must_use]
    pub fn height(&self) -> usize {
        usize::from(self.root.level()) + 1
    }

    pub(crate) const fn comparator(&self) -> &'t dyn KeyComparator {
        self.comparator
    }

    /// Look up the value stored under `key`.
    ///
    /// Returns `Ok(None)` if the key is absent. A ghost entry yields
    /// `Ok(Some(vec![]))`.
    pub fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let leaf = self.descend(key)?;
        let value = leaf
            .find(key, self.comparator)
            .and_then(|index| leaf.entry(index))
            .map(|(_, value)| value.to_vec());
        Ok(value)
    }

    /// Find the entry with the greatest key `<= key`.
    pub fn search_floor(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        // Path of (node, slot taken) from the root down.
        let mut path: Vec<(Cow<'_, Node>, usize)> = Vec::new();
        let mut node = Cow::Borrowed(&self.root);

        loop {
            if node.is_leaf() {
                if let Some(index) = node.floor_index(key, self.comparator) {
                    return Ok(node
                        .entry(index)
                        .map(|(k, v)| (k.to_vec(), v.to_vec())));
                }
                break;
            }
            let Some(index) = node.floor_index(key, self.comparator) else {
                // Every key in this subtree is greater than the search key.
                break;
            };
            let child = self.read_child(&node, index)?;
            path.push((node, index));
            node = Cow::Owned(child);
        }

        // The floor, if any, is the last entry of the nearest subtree to
        // the left on the path.
        while let Some((parent, index)) = path.pop() {
            if index == 0 {
                continue;
            }
            let mut node: Cow<'_, Node> = Cow::Owned(self.read_child(&parent, index - 1)?);
            while !node.is_leaf() {
                let last = node.key_count() - 1;
                node = Cow::Owned(self.read_child(&node, last)?);
            }
            if let Some(last) = node.key_count().checked_sub(1) {
                return Ok(node.entry(last).map(|(k, v)| (k.to_vec(), v.to_vec())));
            }
        }
        Ok(None)
    }

    /// Iterate over entries in `range`, in key order.
    #[must_use]
    pub fn range(&self, range: KeyRange) -> TreeIter<'_> {
        TreeIter::new(self, range)
    }

    /// Iterate over every entry, in key order.
    #[must_use]
    pub fn iter(&self) -> TreeIter<'_> {
        self.range(KeyRange::all())
    }

    /// Walk from the root to the leaf that would hold `key`.
    fn descend(&self, key: &[u8]) -> Result<Cow<'_, Node>, Error> {
        let mut node = Cow::Borrowed(&self.root);
        while !node.is_leaf() {
            // Keys below every separator live in the first child.
            let index = node.floor_index(key, self.comparator).unwrap_or(0);
            node = Cow::Owned(self.read_child(&node, index)?);
        }
        Ok(node)
    }

    /// Read and validate the child referenced by entry `index` of `parent`.
    pub(crate) fn read_child(&self, parent: &Node, index: usize) -> Result<Node, Error> {
        let parent_address = parent.address();
        let value = parent.child_ref(index).ok_or(Error::MalformedNode {
            address: parent_address,
            reason: NodeError::InvalidChildRef { index, len: 0 },
        })?;
        if value == 0 {
            return Err(Error::MalformedNode {
                address: parent_address,
                reason: NodeError::NullChildRef { index },
            });
        }

        let child_ref = match self.config.space() {
            TreeSpace::Physical => ChildRef::Direct(value),
            TreeSpace::Ephemeral => ChildRef::Direct(self.resolver.ephemeral_address(value)?),
            TreeSpace::Virtual => ChildRef::Indirect(value),
        };

        let (address, data) = self.resolver.read_raw(child_ref)?;
        if data.len() != self.config.node_size() {
            return Err(Error::MalformedTree(format!(
                "node {address:#x} is {} bytes but the tree declares {}-byte nodes",
                data.len(),
                self.config.node_size()
            )));
        }

        let verify = self.resolver.config().verify_checksums && !self.config.non_persistent();
        let ctx = ParseContext::child(verify, &self.config);
        let child = Node::parse(address, data, &ctx).map_err(|e| Error::from_node(address, e))?;

        self.resolver.verify_identity(child_ref, child.header())?;
        if self.config.space() == TreeSpace::Ephemeral && child.header().oid != value {
            return Err(Error::corrupt_mapping(
                value,
                child.header().xid,
                format!("ephemeral block {address:#x} holds object {:#x}", child.header().oid),
            ));
        }

        if child.is_root() || u32::from(child.level()) + 1 != u32::from(parent.level()) {
            return Err(Error::MalformedTree(format!(
                "node {address:#x} at level {} (root: {}) is not a child of level {} node {parent_address:#x}",
                child.level(),
                child.is_root(),
                parent.level()
            )));
        }
        child
            .check_order(self.comparator, self.config.allow_ghosts())
            .map_err(|e| Error::from_node(address, e))?;

        tracing::trace!(
            "descended from {parent_address:#x} slot {index} to {address:#x} (level {})",
            child.level()
        );
        Ok(child)
    }
}

impl<'a> IntoIterator for &'a BTree<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;
    type IntoIter = TreeIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
