//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the level comes from `--verbose`.
//! Logs go to stderr so `gw ask --json` output stays machine-readable.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("groundwork={0},gw={0},warn", default_level)));

    // try_init: a second call (tests, embedded use) is not an error.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
