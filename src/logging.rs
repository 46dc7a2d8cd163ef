//! Logger setup shared by both binaries
//!
//! Logs go to stderr. `RUST_LOG` wins when set; otherwise `--verbose`
//! selects `debug` and the default is `warn`.

use env_logger::{Builder, Env};

/// Initialise the global logger once per process
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    // Forked handlers inherit the logger; a second init only happens in tests
    let _ = Builder::from_env(Env::default().default_filter_or(default))
        .format_timestamp_millis()
        .format_target(false)
        .try_init();
}
