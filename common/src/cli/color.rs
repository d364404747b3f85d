//! Terminal color policy for log output.
//!
//! Resolution order in `Auto`:
//! - `NO_COLOR` or `TERM=dumb` turn colors off.
//! - `CLICOLOR_FORCE` turns them on even when piped.
//! - Otherwise color only when the stream is a TTY.
//!
//! An explicit `Always`/`Never` from the command line bypasses all of it.

use std::env;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ColorWhen {
    /// Decide from the environment and the stream.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => match env_override() {
                Some(decision) => decision,
                None => atty::is(stream),
            },
        }
    }

    /// Log output goes to stderr.
    pub fn should_color_stderr(self) -> bool {
        self.should_color(atty::Stream::Stderr)
    }
}

/// Environment decision for `Auto`, `None` when the TTY check should decide.
fn env_override() -> Option<bool> {
    // ---
    if env::var_os("NO_COLOR").is_some_and(|v| !v.is_empty()) {
        return Some(false);
    }
    if env::var("TERM").is_ok_and(|t| t == "dumb") {
        return Some(false);
    }
    if env::var_os("CLICOLOR_FORCE").is_some_and(|v| v != "0") {
        return Some(true);
    }
    None
}
