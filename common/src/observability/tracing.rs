//! Tracing initialization.

use crate::ColorWhen;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `info`, or `debug` for
/// the workspace crates when `verbose` is on (dependencies stay at `info`).
///
/// # Errors
///
/// Returns error if a global subscriber is already installed.
pub fn init_tracing(color: ColorWhen, verbose: bool) -> Result<()> {
    // ---
    let fallback = if verbose {
        "info,caller=debug,signaling=debug,media=debug,sipbridge_common=debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    fmt()
        .with_env_filter(env_filter)
        .with_ansi(color.should_color_stderr())
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}
