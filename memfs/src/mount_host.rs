//! The mount host (C7): validates the mount point, wires producer mode's
//! event queue onto the handler and a listener, then starts the FUSE driver
//! loop. Shutdown is cooperative — once the kernel transport unmounts and
//! `mount2` returns, the event queue is closed and the listener thread is
//! joined before the process exits.

use std::fs;
use std::path::Path;
use std::sync::mpsc;
use std::thread::JoinHandle;

use fuser::MountOption;
use log::info;
use memfs_core::producer::EventSink;
use memfs_core::Handler;
use memfs_listener::{Listener, LoggingHandler};

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum MountHostError {
    #[error("failed to prepare mount point {path}: {source}")]
    MountPoint { path: std::path::PathBuf, source: std::io::Error },
    #[error("failed to initialize filesystem: {0}")]
    Init(#[from] memfs_core::Error),
    #[error("fuse driver error: {0}")]
    Driver(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MountHostError>;

/// Runs the mount host to completion: blocks on the FUSE driver loop until
/// the filesystem is unmounted.
pub fn run(config: &Config) -> Result<()> {
    prepare_mount_point(&config.mountpoint)?;

    let (sink, listener_thread) = if config.producer {
        let (tx, rx) = mpsc::channel();
        let listener = Listener::new(rx, LoggingHandler);
        (Some(EventSink::new(tx)), Some(listener.spawn()))
    } else {
        (None, None)
    };

    let handler = Handler::new(config.root_name.as_bytes(), sink)?;
    let options = mount_options(config);

    info!("mounting memfs at {}", config.mountpoint.display());
    fuser::mount2(handler, &config.mountpoint, &options)?;
    info!("unmounted, shutting down");

    join_listener(listener_thread);
    Ok(())
}

fn prepare_mount_point(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|source| MountHostError::MountPoint { path: path.to_path_buf(), source })?;
    }
    Ok(())
}

fn mount_options(config: &Config) -> Vec<MountOption> {
    let mut options = vec![MountOption::RW, MountOption::FSName("memfs".to_owned()), MountOption::AutoUnmount];
    if config.debug {
        options.push(MountOption::CUSTOM("debug".to_owned()));
    }
    options
}

/// Drops nothing extra here; the sender already went out of scope with
/// `Handler` when `mount2` returned, which is what lets the listener thread
/// observe the channel closing and stop on its own.
fn join_listener(listener_thread: Option<JoinHandle<()>>) {
    if let Some(thread) = listener_thread {
        if thread.join().is_err() {
            log::warn!("listener thread panicked");
        }
    }
}
