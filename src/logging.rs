use tracing_subscriber::EnvFilter;

/// Install a compact fmt subscriber for `filter` (e.g. `"info"` or
/// `"conductor=debug"`). `RUST_LOG` wins when set. Returns `false` if a
/// global subscriber was already installed.
pub fn init(filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .try_init()
        .is_ok()
}

/// Route logs through the test harness so they only show for failing tests.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}
