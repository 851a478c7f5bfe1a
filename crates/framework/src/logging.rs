//! Tracing subscriber setup for test binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "e2e_framework=info,e2e=info";

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; only the first call installs anything.
/// Returns whether this call installed the subscriber.
pub fn init() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}

/// Like [`init`], but emits one JSON object per event.
pub fn init_json() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .is_ok()
}
