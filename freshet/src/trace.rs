//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber filtered by the `FRESHET_LOG`
/// environment variable (same syntax as `RUST_LOG`), defaulting to `warn`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env("FRESHET_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
