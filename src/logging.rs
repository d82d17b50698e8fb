//! Tracing setup for the binaries.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,catalog_rpc=info";

/// Install the global tracing subscriber.
///
/// The filter comes from, in this order:
/// 1) `RUST_LOG`
/// 2) `CATALOG_RPC_LOG`
/// 3) a built in default
pub fn init() {
    let env_filter = filter_from_env();
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let app_filter = env::var("CATALOG_RPC_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok());
    if let Some(filter) = app_filter {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}
