//! Counters behind the `metrics` feature, and the binary's log setup.

use crate::types::EndpointId;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_endpoint(name: &'static str, endpoint_id: &EndpointId) {
    ::metrics::increment_counter!(name, "endpoint" => endpoint_id.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_endpoint(_name: &'static str, _endpoint_id: &EndpointId) {}

/// Install a `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`). Safe to call more than once.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
