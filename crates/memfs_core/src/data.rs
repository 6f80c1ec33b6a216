//! Creates, removes, and mutates inodes and entries atomically, enforcing
//! the cross-index invariants between the node store and the entry index.

use memfs_types::Ino;

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::index::{EntryHandle, EntryIndex, EntryKindFilter};
use crate::node::{Node, NodeKind};
use crate::store::NodeStore;

/// The shape requested from [`Data::add_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewNodeKind {
    File,
    Directory,
}

/// The kind of link requested from [`Data::add_link_entry`].
#[derive(Debug, Clone)]
pub enum LinkSpec {
    Symlink { link_path: Vec<u8> },
    Hardlink { target_inode: Ino },
}

/// Owns the node store and entry index, and is the only component allowed
/// to mutate either directly; [`crate::handler`] never touches them itself.
#[derive(Debug, Default)]
pub struct Data {
    nodes: NodeStore,
    entries: EntryIndex,
    next_inode: u64,
    root_added: bool,
}

impl Data {
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: NodeStore::new(), entries: EntryIndex::new(), next_inode: 2, root_added: false }
    }

    fn alloc_inode(&mut self) -> Ino {
        let value = self.next_inode;
        self.next_inode += 1;
        Ino::new(value).expect("inode counter never yields zero")
    }

    #[must_use]
    pub fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    #[must_use]
    pub fn entries(&self) -> &EntryIndex {
        &self.entries
    }

    /// Called exactly once at startup. `name` is split on the path
    /// separator: the tail becomes the root entry's own name, the prefix (or
    /// `/` if there is none) becomes its containing path.
    pub fn add_root(&mut self, name: &[u8], mode: u32) -> Result<()> {
        if self.root_added {
            return Err(Error::Internal("root already added".to_owned()));
        }
        let (path, root_name) = split_root_name(name);
        let node = Node::new(NodeKind::Directory { root: true }, None, mode, 0, 0);
        self.nodes.insert(Ino::ROOT, node);
        self.entries.add(Entry::plain(Ino::ROOT, root_name, path));
        self.root_added = true;
        Ok(())
    }

    /// Allocates a new inode of `kind`, inserts a plain entry for it under
    /// `parent_inode`, and sets `open_count = 1`.
    pub fn add_entry(&mut self, name: Vec<u8>, parent_inode: Ino, kind: NewNodeKind, data: Vec<u8>, mode: u32) -> Result<EntryHandle> {
        let parent_node = self.nodes.get(parent_inode).ok_or(Error::NoEntry)?;
        if !parent_node.kind.is_dir() {
            return Err(Error::NotDirectory);
        }
        let parent_path = self.full_path(parent_inode)?;

        let inode = self.alloc_inode();
        let node_kind = match kind {
            NewNodeKind::File => NodeKind::File { data },
            NewNodeKind::Directory => NodeKind::Directory { root: false },
        };
        let mut node = Node::new(node_kind, Some(parent_inode), mode, 0, 0);
        node.open_count = 1;
        self.nodes.insert(inode, node);

        let entry = Entry::plain(inode, name, parent_path);
        Ok(self.entries.add(entry))
    }

    /// Adds a symbolic or hard link entry under `parent_inode`.
    pub fn add_link_entry(&mut self, name: Vec<u8>, parent_inode: Ino, spec: LinkSpec, mode: u32) -> Result<EntryHandle> {
        let parent_path = self.full_path(parent_inode)?;
        match spec {
            LinkSpec::Symlink { link_path } => {
                let inode = self.alloc_inode();
                let node = Node::new(NodeKind::File { data: Vec::new() }, Some(parent_inode), mode, 0, 0);
                self.nodes.insert(inode, node);
                let entry = Entry::symlink(inode, name, parent_path, link_path);
                Ok(self.entries.add(entry))
            }
            LinkSpec::Hardlink { target_inode } => {
                if !self.nodes.contains(target_inode) {
                    return Err(Error::NoEntry);
                }
                let entry = Entry::hardlink(target_inode, name, parent_path);
                Ok(self.entries.add(entry))
            }
        }
    }

    /// Returns the plain entry for `inode`, falling back to its (single)
    /// symlink entry if no plain entry exists.
    pub fn get_entry(&self, inode: Ino) -> Result<EntryHandle> {
        let all = self.entries.entries_of(inode, None);
        if let Some(plain) = all.iter().find(|e| !e.borrow().is_symlink() && !e.borrow().is_hardlink()) {
            return Ok(EntryHandle::clone(plain));
        }
        let symlinks = self.entries.entries_of(inode, Some(EntryKindFilter::Symlink));
        symlinks.first().map(EntryHandle::clone).ok_or(Error::NoEntry)
    }

    /// Resolves the full containing path of `inode`'s own directory, i.e.
    /// the path its children would be stored under.
    pub fn full_path(&self, inode: Ino) -> Result<Vec<u8>> {
        let entry = self.get_entry(inode)?;
        let entry = entry.borrow();
        Ok(Entry::join_path(&entry.path, &entry.name))
    }

    /// Returns the children of `inode`. The root directory, having no
    /// parent, returns its own single entry (the kernel looks up `..` of the
    /// root against itself).
    pub fn get_children(&self, inode: Ino) -> Result<Vec<EntryHandle>> {
        let node = self.nodes.get(inode).ok_or(Error::NoEntry)?;
        if !node.kind.is_dir() {
            return Err(Error::NotDirectory);
        }
        if inode.is_root() && node.parent.is_none() {
            return Ok(vec![self.get_entry(inode)?]);
        }
        let dir_path = self.full_path(inode)?;
        Ok(self.entries.list_children(&dir_path))
    }

    /// Finds the child entry named `name` directly under `parent_inode`,
    /// skipping entries whose node has been marked invisible. A rename that
    /// overwrites a target leaves the stale entry in the index (its removal
    /// is deferred to `forget`), so a name match alone is not enough — the
    /// visible entry, if any, must be preferred over it.
    pub fn find_child(&self, parent_inode: Ino, name: &[u8]) -> Result<Option<EntryHandle>> {
        let dir_path = self.full_path(parent_inode)?;
        Ok(self
            .entries
            .list_children(&dir_path)
            .into_iter()
            .find(|e| e.borrow().name == name && self.nodes.get(e.borrow().inode).is_some_and(|n| !n.invisible)))
    }

    /// Finds the entry named `name` directly under the absolute path
    /// `dir_path`, without going through a parent inode. Used to resolve a
    /// symlink's `link_path` back to the entry it points at.
    #[must_use]
    pub fn find_by_path(&self, dir_path: &[u8], name: &[u8]) -> Option<EntryHandle> {
        self.entries.find_by_path_and_name(dir_path, name)
    }

    /// Mutable access to a node, for callers (the handler) that need to
    /// update metadata not covered by a dedicated `Data` method.
    pub fn node_mut(&mut self, inode: Ino) -> Result<&mut Node> {
        self.nodes.get_mut(inode).ok_or(Error::NoEntry)
    }

    /// Clears `locked`, matching the unlock step `release`/`releasedir`
    /// perform before decrementing `open_count`.
    pub fn unlock(&mut self, inode: Ino) {
        if let Some(node) = self.nodes.get_mut(inode) {
            node.locked = false;
        }
    }

    /// Updates the mode/uid/gid/size fields present in the arguments,
    /// truncating or zero-padding the file buffer on a size change, and
    /// always touching `ctime`.
    pub fn set_attrs(&mut self, inode: Ino, mode: Option<u32>, uid: Option<u32>, gid: Option<u32>, size: Option<u64>) -> Result<()> {
        let node = self.nodes.get_mut(inode).ok_or(Error::NoEntry)?;
        if let Some(mode) = mode {
            node.mode = mode;
        }
        if let Some(uid) = uid {
            node.uid = uid;
        }
        if let Some(gid) = gid {
            node.gid = gid;
        }
        if let Some(size) = size {
            node.set_size(size);
        }
        node.touch_ctime();
        Ok(())
    }

    /// Decrements `open_count` by `n`, one step at a time so the
    /// lock-on-underflow rule in [`Node::dec_open_count`] is evaluated after
    /// every step exactly as repeated single decrements would.
    pub fn decrease_op_count_by(&mut self, inode: Ino, n: u64) {
        for _ in 0..n {
            self.try_decrease_op_count(inode);
        }
    }

    /// Removes every entry in `handles` from the entry index. The node
    /// itself is untouched; callers decide separately whether to reclaim it.
    pub fn remove_entries(&mut self, handles: &[EntryHandle]) {
        for handle in handles {
            self.entries.remove(handle);
        }
    }

    /// Reclaims `inode` if it is eligible: a no-op for root, and a no-op
    /// unless `open_count < 1`.
    pub fn try_remove_inode(&mut self, inode: Ino) {
        if inode.is_root() {
            return;
        }
        let Some(node) = self.nodes.get(inode) else { return };
        if node.open_count >= 1 {
            return;
        }
        let handles = self.entries.entries_of(inode, None);
        self.remove_entries(&handles);
        self.nodes.remove(inode);
    }

    /// Increments `open_count`; a no-op for root or a missing inode.
    pub fn try_increase_op_count(&mut self, inode: Ino) {
        if inode.is_root() {
            return;
        }
        if let Some(node) = self.nodes.get_mut(inode) {
            node.inc_open_count();
        }
    }

    /// Decrements `open_count`, applying the lock-on-underflow and
    /// lock-while-invisible rules; a no-op for root or a missing inode.
    pub fn try_decrease_op_count(&mut self, inode: Ino) {
        if inode.is_root() {
            return;
        }
        if let Some(node) = self.nodes.get_mut(inode) {
            node.dec_open_count();
        }
    }

    /// Marks `inode` invisible, locking it immediately if `open_count <= 1`
    /// (the caller is expected to decrement separately via
    /// [`Data::try_decrease_op_count`] where the operation calls for it).
    pub fn mark_invisible(&mut self, inode: Ino) -> Result<()> {
        let node = self.nodes.get_mut(inode).ok_or(Error::NoEntry)?;
        node.invisible = true;
        if node.open_count <= 1 {
            node.locked = true;
        }
        Ok(())
    }

    /// Moves `handle` to `(new_parent_inode, new_name)`, updating the
    /// underlying node's recorded parent and the entry's name in place.
    pub fn move_entry(&mut self, handle: &EntryHandle, new_parent_inode: Ino, new_name: Vec<u8>) -> Result<()> {
        let new_parent_path = self.full_path(new_parent_inode)?;
        {
            let mut entry = handle.borrow_mut();
            entry.name = new_name;
        }
        let inode = handle.borrow().inode;
        self.entries.move_entry(handle, new_parent_path);
        if let Some(node) = self.nodes.get_mut(inode) {
            node.parent = Some(new_parent_inode);
        }
        Ok(())
    }
}

fn split_root_name(name: &[u8]) -> (Vec<u8>, Vec<u8>) {
    match name.iter().rposition(|&b| b == b'/') {
        Some(pos) => {
            let mut path = name[..pos].to_vec();
            if path.is_empty() {
                path.push(b'/');
            } else if path[0] != b'/' {
                path.insert(0, b'/');
            }
            (path, name[pos + 1..].to_vec())
        }
        None => (vec![b'/'], name.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_with_root() -> Data {
        let mut data = Data::new();
        data.add_root(b"/", libc::S_IFDIR | 0o755).unwrap();
        data
    }

    #[test]
    fn add_root_is_single_use() {
        let mut data = data_with_root();
        assert!(data.add_root(b"/", 0).is_err());
    }

    #[test]
    fn add_entry_creates_child_under_root() {
        let mut data = data_with_root();
        let handle = data.add_entry(b"foo".to_vec(), Ino::ROOT, NewNodeKind::File, Vec::new(), libc::S_IFREG | 0o644).unwrap();
        assert_eq!(handle.borrow().name, b"foo");
        let children = data.get_children(Ino::ROOT).unwrap();
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn add_entry_rejects_non_directory_parent() {
        let mut data = data_with_root();
        let file = data.add_entry(b"foo".to_vec(), Ino::ROOT, NewNodeKind::File, Vec::new(), libc::S_IFREG | 0o644).unwrap();
        let inode = file.borrow().inode;
        let err = data.add_entry(b"bar".to_vec(), inode, NewNodeKind::File, Vec::new(), 0).unwrap_err();
        assert!(matches!(err, Error::NotDirectory));
    }

    #[test]
    fn hardlink_raises_nlink() {
        let mut data = data_with_root();
        let file = data.add_entry(b"p".to_vec(), Ino::ROOT, NewNodeKind::File, Vec::new(), libc::S_IFREG | 0o644).unwrap();
        let inode = file.borrow().inode;
        data.add_link_entry(b"q".to_vec(), Ino::ROOT, LinkSpec::Hardlink { target_inode: inode }, 0).unwrap();
        let hardlinks = data.entries().entries_of(inode, Some(EntryKindFilter::Hardlink));
        assert_eq!(hardlinks.len(), 1);
    }

    #[test]
    fn try_remove_inode_is_noop_while_open() {
        let mut data = data_with_root();
        let file = data.add_entry(b"p".to_vec(), Ino::ROOT, NewNodeKind::File, Vec::new(), libc::S_IFREG | 0o644).unwrap();
        let inode = file.borrow().inode;
        data.try_remove_inode(inode);
        assert!(data.nodes().contains(inode));
    }

    #[test]
    fn try_remove_inode_reclaims_when_closed() {
        let mut data = data_with_root();
        let file = data.add_entry(b"p".to_vec(), Ino::ROOT, NewNodeKind::File, Vec::new(), libc::S_IFREG | 0o644).unwrap();
        let inode = file.borrow().inode;
        data.try_decrease_op_count(inode);
        data.try_remove_inode(inode);
        assert!(!data.nodes().contains(inode));
    }

    #[test]
    fn move_entry_updates_parent_and_path() {
        let mut data = data_with_root();
        let dir = data.add_entry(b"a".to_vec(), Ino::ROOT, NewNodeKind::Directory, Vec::new(), libc::S_IFDIR | 0o755).unwrap();
        let dir_inode = dir.borrow().inode;
        let file = data.add_entry(b"f".to_vec(), Ino::ROOT, NewNodeKind::File, Vec::new(), libc::S_IFREG | 0o644).unwrap();
        let file_inode = file.borrow().inode;
        data.move_entry(&file, dir_inode, b"g".to_vec()).unwrap();
        assert_eq!(data.get_children(Ino::ROOT).unwrap().len(), 1);
        assert_eq!(data.get_children(dir_inode).unwrap().len(), 1);
        assert_eq!(data.nodes().get(file_inode).unwrap().parent, Some(dir_inode));
    }
}
