//! Logging setup.
//!
//! The library only emits `tracing` events; binaries and tests decide where
//! they go. [`init`] installs a formatting subscriber filtered by `RUST_LOG`,
//! falling back to `pullwire=<level>`.

use tracing_subscriber::EnvFilter;

/// Install a global subscriber. Returns `false` if one was already set, so
/// calling it from several tests is harmless.
pub fn init(default_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pullwire={}", default_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Subscriber for tests: captured by the test harness, quiet unless
/// `RUST_LOG` says otherwise.
pub fn init_for_tests() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        init("debug");
        assert!(!init("trace"));
        assert!(!init_for_tests());
        tracing::debug!("logging initialised");
    }
}
