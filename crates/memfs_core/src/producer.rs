//! Wraps the handler's data-layer calls: after each mutating or observed
//! operation succeeds, builds a snapshot of the affected node/entry and
//! enqueues a structured event for the listener runtime.

use std::sync::mpsc::Sender;

use memfs_types::{Event, Extras, Operation, TargetSnapshot, system_time_to_ns};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::node::Node;

/// The sending half of the event queue, installed on the handler when
/// producer mode is enabled. Producer mode is strict: if this is configured
/// but the channel's receiver has already gone away, emitting an event is a
/// hard failure rather than a silently dropped one.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    #[must_use]
    pub const fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }

    /// Builds and sends an event for `operation`, with `node`/`entry`
    /// describing the affected inode at the moment of the call (the caller
    /// is responsible for capturing the snapshot at the right point: after
    /// completion for ordinary operations, before removal for deletes).
    pub fn emit(&self, operation: Operation, node: &Node, entry: &Entry, extras: Extras) -> Result<()> {
        let target = snapshot(node, entry);
        let event = Event::new(operation, target, extras);
        self.tx.send(event).map_err(|_| Error::Internal("event queue receiver has gone away".to_owned()))
    }
}

/// Captures the salient, detached fields of `node` and `entry` for transit
/// across the producer/listener channel.
#[must_use]
pub fn snapshot(node: &Node, entry: &Entry) -> TargetSnapshot {
    TargetSnapshot {
        inode: entry.inode.get(),
        name: entry.name.clone(),
        path: entry.path.clone(),
        mode: node.mode,
        size: node.size(),
        atime_ns: system_time_to_ns(node.atime),
        mtime_ns: system_time_to_ns(node.mtime),
        ctime_ns: system_time_to_ns(node.ctime),
    }
}
