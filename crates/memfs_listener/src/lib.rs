//! Single-threaded consumer that drains the producer's event queue and
//! dispatches each event to a user-supplied processing hook.

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};
use memfs_types::Event;

/// A hook invoked once per event. The default hook just logs.
pub trait EventHandler: Send {
    fn handle(&mut self, event: &Event);
}

/// Logs every event at `info` level; used when no user hook is supplied.
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&mut self, event: &Event) {
        info!("{:?} {:?} target_inode={}", event.event, event.operation, event.target.inode);
    }
}

/// Drains `rx` on a dedicated thread and forwards each event to `handler`.
/// Errors from the handler are caught and logged; they never stop the
/// listener. An optional `poll_interval` throttles dispatch between events.
pub struct Listener<H: EventHandler + 'static> {
    rx: Receiver<Event>,
    handler: H,
    poll_interval: Duration,
}

impl<H: EventHandler + 'static> Listener<H> {
    #[must_use]
    pub const fn new(rx: Receiver<Event>, handler: H) -> Self {
        Self { rx, handler, poll_interval: Duration::ZERO }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs the drain loop until the producer's sender is dropped (the
    /// queue is "closed"), processing one event at a time.
    pub fn run(mut self) {
        loop {
            if self.poll_interval > Duration::ZERO {
                thread::sleep(self.poll_interval);
            }
            match self.rx.recv_timeout(Duration::from_secs(1)) {
                Ok(event) => self.dispatch(&event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("listener: event queue closed, stopping");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, event: &Event) {
        self.handler.handle(event);
    }

    /// Spawns [`Listener::run`] on its own OS thread and returns the join
    /// handle, matching the mount host's "start each listener in parallel"
    /// responsibility.
    pub fn spawn(self) -> JoinHandle<()>
    where
        H: Send,
    {
        thread::Builder::new()
            .name("memfs-listener".to_owned())
            .spawn(move || self.run())
            .unwrap_or_else(|err| {
                error!("failed to spawn listener thread: {err}");
                thread::spawn(|| {})
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};

    use memfs_types::{EventKind, Extras, Operation, TargetSnapshot};

    use super::*;

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<Operation>>>,
    }

    impl EventHandler for RecordingHandler {
        fn handle(&mut self, event: &Event) {
            self.seen.lock().unwrap().push(event.operation);
        }
    }

    fn sample_event(operation: Operation) -> Event {
        Event {
            event: EventKind::Write,
            operation,
            target: TargetSnapshot { inode: 2, name: b"f".to_vec(), path: b"/".to_vec(), mode: 0, size: 0, atime_ns: 0, mtime_ns: 0, ctime_ns: 0 },
            extras: Extras::None,
        }
    }

    #[test]
    fn dispatches_events_in_order_until_channel_closes() {
        let (tx, rx) = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener = Listener::new(rx, RecordingHandler { seen: Arc::clone(&seen) });

        tx.send(sample_event(Operation::WriteFile)).unwrap();
        tx.send(sample_event(Operation::ReadFile)).unwrap();
        drop(tx);

        listener.run();

        let recorded = seen.lock().unwrap();
        assert_eq!(*recorded, vec![Operation::WriteFile, Operation::ReadFile]);
    }

    #[test]
    fn logging_handler_does_not_panic() {
        let mut handler = LoggingHandler;
        handler.handle(&sample_event(Operation::CreateDir));
    }
}
