//! The explicit configuration value threaded to the mount host, built from
//! the CLI surface via `clap` derive instead of reading globals.

use std::path::PathBuf;

use clap::Parser;

/// An in-memory filesystem exposed over FUSE.
#[derive(Debug, Parser)]
#[command(name = "memfs", version, about)]
pub struct Config {
    /// Directory to mount the filesystem at. Created if it does not exist.
    pub mountpoint: PathBuf,

    /// Pass FUSE's own debug option through to the kernel transport and
    /// default the log filter to `debug` when `RUST_LOG` is unset.
    #[arg(long)]
    pub debug: bool,

    /// Enable producer mode: emit an event for every mutating or observed
    /// operation and start the default listener that logs them.
    #[arg(long)]
    pub producer: bool,

    /// Name given to the root entry at startup.
    #[arg(long, default_value = "/")]
    pub root_name: String,
}

impl Config {
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
