//! Binary entry point: parses the CLI surface, installs the logger, and
//! hands off to the mount host (C7). Library crates never initialize a
//! logger themselves; this binary is the sole place that decides how logs
//! are rendered.

mod config;
mod mount_host;

use std::process::ExitCode;

use config::Config;
use log::LevelFilter;

fn main() -> ExitCode {
    let config = Config::parse_args();
    init_logger(config.debug);

    match mount_host::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// `--debug` is sugar that forces the default filter to `debug` when
/// `RUST_LOG` is unset, rather than a separate ad hoc logging mode.
fn init_logger(debug: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if debug && std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}
