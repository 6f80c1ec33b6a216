//! Shared types for the in-memory FUSE filesystem: the inode identifier and
//! the structured events emitted by producer mode.

use std::num::NonZeroU64;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A unique, monotonically increasing identifier for a [`Node`](https://docs.rs/memfs_core).
///
/// Inode `1` is reserved for the root directory; it is never reused while the
/// filesystem is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ino(NonZeroU64);

impl Ino {
    pub const ROOT: Self = Self(NonZeroU64::new(1).unwrap());

    #[must_use]
    pub const fn new(n: u64) -> Option<Self> {
        match NonZeroU64::new(n) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0.get() == 1
    }
}

impl std::fmt::Display for Ino {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Ino> for u64 {
    fn from(ino: Ino) -> Self {
        ino.get()
    }
}

/// The coarse-grained event kind, used for routing in external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Read,
    Write,
    Rename,
    Remove,
}

/// The fine-grained operation tag carried by every [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    CreateFile,
    CreateDir,
    ReadFile,
    ReadDir,
    WriteFile,
    RenameFile,
    RenameDir,
    RemoveFile,
    RemoveDir,
}

impl Operation {
    #[must_use]
    pub const fn kind(self) -> EventKind {
        match self {
            Self::CreateFile | Self::CreateDir => EventKind::Create,
            Self::ReadFile | Self::ReadDir => EventKind::Read,
            Self::WriteFile => EventKind::Write,
            Self::RenameFile | Self::RenameDir => EventKind::Rename,
            Self::RemoveFile | Self::RemoveDir => EventKind::Remove,
        }
    }
}

/// A snapshot of a node and the entry that named it at the moment an event
/// fired, detached from the live data model so it can cross a thread
/// boundary freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSnapshot {
    pub inode: u64,
    pub name: Vec<u8>,
    pub path: Vec<u8>,
    pub mode: u32,
    pub size: u64,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
}

/// Operation-specific data that does not fit the common [`TargetSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Extras {
    None,
    /// Bytes returned by a `read`.
    ReadBytes(Vec<u8>),
    /// Byte count accepted by a `write`.
    WriteLen(u64),
    /// The new containing directory and the new name, for a `rename`.
    Renamed { new_dir: TargetSnapshot, new_name: Vec<u8> },
}

/// A single record emitted onto the event queue by the producer wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event: EventKind,
    pub operation: Operation,
    pub target: TargetSnapshot,
    pub extras: Extras,
}

impl Event {
    #[must_use]
    pub fn new(operation: Operation, target: TargetSnapshot, extras: Extras) -> Self {
        Self { event: operation.kind(), operation, target, extras }
    }
}

/// Converts a [`SystemTime`] to nanoseconds since the epoch, saturating
/// instead of panicking on clock skew before `UNIX_EPOCH`.
#[must_use]
pub fn system_time_to_ns(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}
