//! Tracing setup for binaries and long-running services.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to `weave=info` when unset. Safe to call
/// more than once (later calls are no-ops).
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weave=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
