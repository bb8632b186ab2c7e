//! Log capture for tests.
//!
//! The default filter shows the control-session exchange and the daemon's
//! own output at `debug`, which is usually what a failing lifecycle test
//! needs. `RUST_LOG` overrides it.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_TEST_FILTER: &str = "warn,onionkeeper_core=debug,onionkeeper::daemon=debug";

/// Install a subscriber that writes through the test harness, so output is
/// only shown for failing tests. Later calls in the same process do nothing.
pub fn init_test_tracing() {
    init_test_tracing_with(DEFAULT_TEST_FILTER);
}

/// Like [`init_test_tracing`], with `filter` as the fallback directive.
pub fn init_test_tracing_with(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
