//! Tracing bootstrap

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber filtered by `RUST_LOG` (or `default_filter`).
///
/// Returns false when a global subscriber is already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
