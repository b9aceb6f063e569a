//! Structured logging setup.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber, honoring `RUST_LOG` when set
/// and otherwise falling back to the configured default level.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
