//! Builds the kernel-facing attribute record for a node.

use std::time::Duration;

use fuser::{FileAttr, FileType};
use memfs_types::Ino;

use crate::node::{Node, NodeKind};

/// TTL handed back with every successful `lookup`/`getattr` reply. The data
/// layer has no independent cache to invalidate against, so a short TTL is
/// used purely to bound how stale the kernel's own attribute cache can get.
pub const ATTR_TTL: Duration = Duration::from_secs(1);

/// TTL used for negative (`inode == 0`) lookup replies, per the bounded-cache
/// behavior: a miss is remembered for one second before the kernel asks again.
pub const NEGATIVE_LOOKUP_TTL: Duration = Duration::from_secs(1);

/// Builds the [`FileAttr`] the kernel expects for `inode`, given its node and
/// the number of hardlink entries pointing at it (`nlink = 1 + hardlinks`).
#[must_use]
pub fn file_attr(inode: Ino, node: &Node, hardlink_count: u32) -> FileAttr {
    let kind = if node.kind.is_dir() {
        FileType::Directory
    } else if is_symlink_mode(node.mode) {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    let size = node.size();
    let blocks = size.div_ceil(512);
    FileAttr {
        ino: inode.get(),
        size,
        blocks,
        atime: node.atime,
        mtime: node.mtime,
        ctime: node.ctime,
        crtime: node.ctime,
        kind,
        perm: perm_bits(node.mode),
        nlink: 1 + hardlink_count,
        uid: node.uid,
        gid: node.gid,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn is_symlink_mode(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFLNK
}

fn perm_bits(mode: u32) -> u16 {
    (mode & 0o7777) as u16
}

/// An empty-attribute negative-cache reply: `inode == 0`, used when `lookup`
/// finds no matching entry.
#[must_use]
pub const fn negative_lookup_attr() -> FileAttr {
    FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: std::time::UNIX_EPOCH,
        mtime: std::time::UNIX_EPOCH,
        ctime: std::time::UNIX_EPOCH,
        crtime: std::time::UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind as Kind;

    #[test]
    fn directory_attr_has_zero_size() {
        let node = Node::new(Kind::Directory { root: false }, None, libc::S_IFDIR | 0o755, 0, 0);
        let attr = file_attr(Ino::ROOT, &node, 0);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn hardlink_count_feeds_nlink() {
        let node = Node::new(Kind::File { data: vec![1, 2, 3] }, None, libc::S_IFREG | 0o644, 0, 0);
        let attr = file_attr(Ino::ROOT, &node, 2);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.nlink, 3);
    }
}
