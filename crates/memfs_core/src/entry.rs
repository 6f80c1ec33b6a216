//! A named reference in a directory to a node.

use memfs_types::Ino;

/// The three shapes an [`Entry`] can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// The canonical name for a node.
    Plain,
    /// A second name for an already-existing inode.
    Hardlink,
    /// A name whose target is an opaque path string resolved by the kernel.
    Symlink { link_path: Vec<u8> },
}

/// A directory entry: `name` within `path` refers to `inode`.
#[derive(Debug, Clone)]
pub struct Entry {
    pub inode: Ino,
    pub name: Vec<u8>,
    pub path: Vec<u8>,
    pub kind: EntryKind,
}

impl Entry {
    #[must_use]
    pub fn plain(inode: Ino, name: Vec<u8>, path: Vec<u8>) -> Self {
        Self { inode, name, path, kind: EntryKind::Plain }
    }

    #[must_use]
    pub fn hardlink(inode: Ino, name: Vec<u8>, path: Vec<u8>) -> Self {
        Self { inode, name, path, kind: EntryKind::Hardlink }
    }

    #[must_use]
    pub fn symlink(inode: Ino, name: Vec<u8>, path: Vec<u8>, link_path: Vec<u8>) -> Self {
        Self { inode, name, path, kind: EntryKind::Symlink { link_path } }
    }

    #[must_use]
    pub const fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }

    #[must_use]
    pub const fn is_hardlink(&self) -> bool {
        matches!(self.kind, EntryKind::Hardlink)
    }

    #[must_use]
    pub fn link_path(&self) -> Option<&[u8]> {
        match &self.kind {
            EntryKind::Symlink { link_path } => Some(link_path),
            _ => None,
        }
    }

    /// Joins `path` and `name` with the path separator, the same scheme
    /// used to derive a child's containing path from its parent directory.
    #[must_use]
    pub fn join_path(dir_path: &[u8], name: &[u8]) -> Vec<u8> {
        let mut out = dir_path.to_vec();
        if out.last() != Some(&b'/') {
            out.push(b'/');
        }
        out.extend_from_slice(name);
        out
    }
}
