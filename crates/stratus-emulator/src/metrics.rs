//! Prometheus metrics for the emulator.
//!
//! Tracks dispatch outcomes, extension short-circuits and proxy activity.
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};

lazy_static! {
    /// Requests answered by the dispatcher
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "stratus_requests_total",
        "Total number of requests answered by the dispatcher",
        &["service", "status"]
    )
    .unwrap();

    /// Requests answered by an extension before reaching a handler
    pub static ref EXTENSION_SHORT_CIRCUITS_TOTAL: CounterVec = register_counter_vec!(
        "stratus_extension_short_circuits_total",
        "Requests answered by an extension request hook",
        &["extension"]
    )
    .unwrap();

    /// Handlers that failed with a non-domain error
    pub static ref HANDLER_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "stratus_handler_failures_total",
        "Handler invocations that failed with an unexpected error",
        &["service"]
    )
    .unwrap();

    /// Time spent inside the dispatcher
    pub static ref DISPATCH_DURATION_MS: HistogramVec = register_histogram_vec!(
        "stratus_dispatch_duration_ms",
        "Histogram of dispatch time in milliseconds",
        &["service"],
        vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 100.0]
    )
    .unwrap();

    /// CONNECT tunnels handled by the proxy
    pub static ref PROXY_TUNNELS_TOTAL: CounterVec = register_counter_vec!(
        "stratus_proxy_tunnels_total",
        "CONNECT tunnels handled by the proxy",
        &["mode"]  // mode: intercept|relay
    )
    .unwrap();

    /// Leaf certificates signed by the proxy CA
    pub static ref CERTIFICATES_MINTED_TOTAL: IntCounter = register_int_counter!(
        "stratus_certificates_minted_total",
        "Leaf certificates minted by the proxy"
    )
    .unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(service: &str, status: u16, elapsed_ms: f64) {
    REQUESTS_TOTAL
        .with_label_values(&[service, &status.to_string()])
        .inc();
    DISPATCH_DURATION_MS
        .with_label_values(&[service])
        .observe(elapsed_ms);
}

pub fn record_short_circuit(extension: &str) {
    EXTENSION_SHORT_CIRCUITS_TOTAL
        .with_label_values(&[extension])
        .inc();
}

pub fn record_handler_failure(service: &str) {
    HANDLER_FAILURES_TOTAL.with_label_values(&[service]).inc();
}

pub fn record_tunnel(mode: &str) {
    PROXY_TUNNELS_TOTAL.with_label_values(&[mode]).inc();
}

pub fn record_certificate_minted() {
    CERTIFICATES_MINTED_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_shows_in_output() {
        record_request("metrics-test-svc", 200, 0.2);
        record_short_circuit("metrics-test-ext");
        let output = collect_metrics();
        assert!(output.contains("stratus_requests_total"));
        assert!(output.contains("metrics-test-svc"));
        assert!(output.contains("metrics-test-ext"));
    }

    #[test]
    fn test_counter_increments() {
        let before = REQUESTS_TOTAL
            .with_label_values(&["metrics-count-svc", "404"])
            .get();
        record_request("metrics-count-svc", 404, 0.1);
        let after = REQUESTS_TOTAL
            .with_label_values(&["metrics-count-svc", "404"])
            .get();
        assert_eq!(after - before, 1.0);
    }
}
