//! Maps directory paths to the entries they contain, and inodes to the
//! entries that reference them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use memfs_types::Ino;

use crate::entry::{Entry, EntryKind};

/// A handle to a single [`Entry`], shared between [`EntryIndex::by_dir`] and
/// [`EntryIndex::by_inode`] so that renaming an entry in place is visible
/// from both indices without having to keep two copies synchronized field by
/// field.
pub type EntryHandle = Rc<RefCell<Entry>>;

/// The dual index over directory entries described in the data model: one
/// bucket per containing path, one bucket per referenced inode.
#[derive(Debug, Default)]
pub struct EntryIndex {
    by_dir: HashMap<Vec<u8>, Vec<EntryHandle>>,
    by_inode: HashMap<Ino, Vec<EntryHandle>>,
}

impl EntryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self { by_dir: HashMap::new(), by_inode: HashMap::new() }
    }

    /// Appends `entry` to both indices, returning the shared handle.
    pub fn add(&mut self, entry: Entry) -> EntryHandle {
        let inode = entry.inode;
        let path = entry.path.clone();
        let handle = Rc::new(RefCell::new(entry));
        self.by_dir.entry(path).or_default().push(Rc::clone(&handle));
        self.by_inode.entry(inode).or_default().push(Rc::clone(&handle));
        handle
    }

    /// Removes the entry matching `handle` from both indices.
    pub fn remove(&mut self, handle: &EntryHandle) {
        let (inode, path) = {
            let entry = handle.borrow();
            (entry.inode, entry.path.clone())
        };
        if let Some(bucket) = self.by_dir.get_mut(&path) {
            bucket.retain(|e| !Rc::ptr_eq(e, handle));
            if bucket.is_empty() {
                self.by_dir.remove(&path);
            }
        }
        if let Some(bucket) = self.by_inode.get_mut(&inode) {
            bucket.retain(|e| !Rc::ptr_eq(e, handle));
            if bucket.is_empty() {
                self.by_inode.remove(&inode);
            }
        }
    }

    /// Atomically relocates `handle` from its current containing path to
    /// `new_path`, updating the entry's own `path` field in place.
    pub fn move_entry(&mut self, handle: &EntryHandle, new_path: Vec<u8>) {
        let old_path = {
            let mut entry = handle.borrow_mut();
            let old_path = std::mem::replace(&mut entry.path, new_path.clone());
            old_path
        };
        if let Some(bucket) = self.by_dir.get_mut(&old_path) {
            bucket.retain(|e| !Rc::ptr_eq(e, handle));
            if bucket.is_empty() {
                self.by_dir.remove(&old_path);
            }
        }
        self.by_dir.entry(new_path).or_default().push(Rc::clone(handle));
    }

    /// Returns the entries whose containing path equals `dir_path`.
    #[must_use]
    pub fn list_children(&self, dir_path: &[u8]) -> Vec<EntryHandle> {
        self.by_dir.get(dir_path).cloned().unwrap_or_default()
    }

    /// Finds the child entry named `name` directly under `dir_path`.
    #[must_use]
    pub fn find_by_path_and_name(&self, dir_path: &[u8], name: &[u8]) -> Option<EntryHandle> {
        self.by_dir
            .get(dir_path)?
            .iter()
            .find(|e| e.borrow().name == name)
            .map(Rc::clone)
    }

    /// Returns every entry referencing `inode`, optionally filtered by kind.
    #[must_use]
    pub fn entries_of(&self, inode: Ino, kind: Option<EntryKindFilter>) -> Vec<EntryHandle> {
        let Some(bucket) = self.by_inode.get(&inode) else {
            return Vec::new();
        };
        match kind {
            None => bucket.clone(),
            Some(filter) => bucket.iter().filter(|e| filter.matches(&e.borrow().kind)).cloned().collect(),
        }
    }
}

/// Filter passed to [`EntryIndex::entries_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKindFilter {
    Plain,
    Hardlink,
    Symlink,
}

impl EntryKindFilter {
    fn matches(self, kind: &EntryKind) -> bool {
        match (self, kind) {
            (Self::Plain, EntryKind::Plain) | (Self::Hardlink, EntryKind::Hardlink) | (Self::Symlink, EntryKind::Symlink { .. }) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ino(n: u64) -> Ino {
        Ino::new(n).unwrap()
    }

    #[test]
    fn add_populates_both_indices() {
        let mut idx = EntryIndex::new();
        let handle = idx.add(Entry::plain(ino(2), b"foo".to_vec(), b"/".to_vec()));
        assert_eq!(idx.list_children(b"/").len(), 1);
        assert_eq!(idx.entries_of(ino(2), None).len(), 1);
        assert!(Rc::ptr_eq(&idx.list_children(b"/")[0], &handle));
    }

    #[test]
    fn remove_clears_both_indices() {
        let mut idx = EntryIndex::new();
        let handle = idx.add(Entry::plain(ino(2), b"foo".to_vec(), b"/".to_vec()));
        idx.remove(&handle);
        assert!(idx.list_children(b"/").is_empty());
        assert!(idx.entries_of(ino(2), None).is_empty());
    }

    #[test]
    fn move_entry_relocates_directory_bucket_only() {
        let mut idx = EntryIndex::new();
        let handle = idx.add(Entry::plain(ino(2), b"foo".to_vec(), b"/a".to_vec()));
        idx.move_entry(&handle, b"/b".to_vec());
        assert!(idx.list_children(b"/a").is_empty());
        assert_eq!(idx.list_children(b"/b").len(), 1);
        assert_eq!(handle.borrow().path, b"/b");
        assert_eq!(idx.entries_of(ino(2), None).len(), 1);
    }

    #[test]
    fn find_by_path_and_name() {
        let mut idx = EntryIndex::new();
        idx.add(Entry::plain(ino(2), b"foo".to_vec(), b"/".to_vec()));
        assert!(idx.find_by_path_and_name(b"/", b"foo").is_some());
        assert!(idx.find_by_path_and_name(b"/", b"bar").is_none());
    }

    #[test]
    fn entries_of_filters_by_kind() {
        let mut idx = EntryIndex::new();
        idx.add(Entry::plain(ino(2), b"foo".to_vec(), b"/".to_vec()));
        idx.add(Entry::hardlink(ino(2), b"bar".to_vec(), b"/".to_vec()));
        assert_eq!(idx.entries_of(ino(2), Some(EntryKindFilter::Plain)).len(), 1);
        assert_eq!(idx.entries_of(ino(2), Some(EntryKindFilter::Hardlink)).len(), 1);
    }
}
