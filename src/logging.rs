//! `env_logger` setup. The library itself only ever uses the `log` macros,
//! so embedding applications are free to install any other logger instead.

use env_logger::{Builder, Env};

/// Install `env_logger`, honouring `RUST_LOG` and defaulting to `info`. Does
/// nothing if a logger is already installed.
pub fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .try_init();
}

/// Like [`init()`], but captured by the test harness
pub fn init_for_tests() {
    let _ = Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
