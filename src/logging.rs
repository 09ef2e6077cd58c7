//! Subscriber setup for binaries and tests.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's call. These helpers cover the common case of formatted output.

use tracing::Level;

/// Installs a formatted subscriber at `level` as the global default.
///
/// Fails if a global subscriber is already installed.
pub fn try_init(level: Level) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_target(true)
    .try_init()
}

/// Installs a debug-level subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_for_tests() {
  let _ = tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init();
}

/// Parses a level name such as `"info"` or `"DEBUG"`.
pub fn parse_level(name: &str) -> Option<Level> {
  name.trim().parse().ok()
}
