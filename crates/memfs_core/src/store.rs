//! Owns file/directory content nodes keyed by inode.

use std::collections::HashMap;

use memfs_types::Ino;

use crate::node::Node;

/// The node table. A node's mutable fields are updated in place; no lock is
/// embedded per node because the data layer that owns a `NodeStore` is only
/// ever touched from the single FUSE driver thread (see the concurrency
/// model).
#[derive(Debug, Default)]
pub struct NodeStore {
    nodes: HashMap<Ino, Node>,
}

impl NodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: HashMap::new() }
    }

    #[must_use]
    pub fn get(&self, inode: Ino) -> Option<&Node> {
        self.nodes.get(&inode)
    }

    pub fn get_mut(&mut self, inode: Ino) -> Option<&mut Node> {
        self.nodes.get_mut(&inode)
    }

    pub fn insert(&mut self, inode: Ino, node: Node) {
        self.nodes.insert(inode, node);
    }

    pub fn remove(&mut self, inode: Ino) -> Option<Node> {
        self.nodes.remove(&inode)
    }

    #[must_use]
    pub fn contains(&self, inode: Ino) -> bool {
        self.nodes.contains_key(&inode)
    }

    pub fn iter_inodes(&self) -> impl Iterator<Item = Ino> + '_ {
        self.nodes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ino, &Node)> {
        self.nodes.iter().map(|(ino, node)| (*ino, node))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
