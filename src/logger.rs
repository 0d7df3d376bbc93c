//! Centralized logging configuration for swarm-pgo binaries and tests.
//!
//! Provides a consistent tracing setup with a default INFO level that can be
//! overridden through the `RUST_LOG` environment variable.

use tracing::Level;

/// Initialize the tracing subscriber with swarm-pgo's standard configuration.
///
/// Default log level: INFO (overrideable via `RUST_LOG`).
///
/// # Example
/// ```no_run
/// swarm_pgo::logger::init_logger();
/// tracing::info!("agent starting");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level.
///
/// Safe to call more than once (subsequent calls are no-ops), which keeps it
/// usable from parallel test binaries.
pub fn init_logger_with_level(default_level: Level) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
