//! Tracing bootstrap for hosts embedding the engine

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber: `RUST_LOG` if set, else `default_filter`.
///
/// Returns false when a global subscriber is already installed, which
/// makes repeated calls from tests harmless.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .is_ok()
}
