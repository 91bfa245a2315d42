//! Process-wide statistics registry.
//!
//! Counter/gauge/histogram handles are cheap atomic clones suitable for hot
//! paths; only registration takes the registry mutex. Metrics are exposed in
//! Prometheus text form through [`gather`].

use lazy_static::lazy_static;
use parking_lot::Mutex;
use prometheus::{Encoder, HistogramOpts, Opts, Registry};
use std::collections::HashMap;

pub use prometheus::{Histogram, IntCounter, IntGauge};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref COUNTERS: Mutex<HashMap<String, IntCounter>> = Mutex::new(HashMap::new());
    static ref GAUGES: Mutex<HashMap<String, IntGauge>> = Mutex::new(HashMap::new());
    static ref HISTOGRAMS: Mutex<HashMap<String, Histogram>> = Mutex::new(HashMap::new());
}

/// Map a human-readable label onto a valid Prometheus metric name.
fn prometheus_name(label: &str) -> String {
    let mut name = String::with_capacity(label.len());
    for (i, c) in label.chars().enumerate() {
        let valid = c.is_ascii_alphabetic() || c == '_' || (i > 0 && c.is_ascii_digit());
        name.push(if valid { c.to_ascii_lowercase() } else { '_' });
    }
    // Collapse runs introduced by substitution to keep names readable.
    let mut collapsed = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }
    let name = collapsed.trim_matches('_').to_string();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return format!("geds_{name}");
    }
    name
}

pub fn counter(label: &str) -> IntCounter {
    let mut counters = COUNTERS.lock();
    counters
        .entry(label.to_string())
        .or_insert_with(|| {
            let counter =
                IntCounter::with_opts(Opts::new(prometheus_name(label), label.to_string()))
                    .expect("counter options are valid");
            if let Err(err) = REGISTRY.register(Box::new(counter.clone())) {
                tracing::warn!(label, %err, "failed to register counter");
            }
            counter
        })
        .clone()
}

pub fn gauge(label: &str) -> IntGauge {
    let mut gauges = GAUGES.lock();
    gauges
        .entry(label.to_string())
        .or_insert_with(|| {
            let gauge = IntGauge::with_opts(Opts::new(prometheus_name(label), label.to_string()))
                .expect("gauge options are valid");
            if let Err(err) = REGISTRY.register(Box::new(gauge.clone())) {
                tracing::warn!(label, %err, "failed to register gauge");
            }
            gauge
        })
        .clone()
}

pub fn histogram(label: &str, buckets: Vec<f64>) -> Histogram {
    let mut histograms = HISTOGRAMS.lock();
    histograms
        .entry(label.to_string())
        .or_insert_with(|| {
            let opts = HistogramOpts::new(prometheus_name(label), label.to_string())
                .buckets(buckets);
            let histogram = Histogram::with_opts(opts).expect("histogram options are valid");
            if let Err(err) = REGISTRY.register(Box::new(histogram.clone())) {
                tracing::warn!(label, %err, "failed to register histogram");
            }
            histogram
        })
        .clone()
}

/// Histogram with power-of-two byte-size buckets, 64 B through 512 MiB.
pub fn io_histogram(label: &str) -> Histogram {
    histogram(label, (0..24).map(|i| (1u64 << (i + 6)) as f64).collect())
}

/// All registered metrics in Prometheus text exposition format. Encoding is
/// best-effort and never fails loudly.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(%err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_map_to_valid_prometheus_names() {
        assert_eq!(
            prometheus_name("GEDS: TcpTransport sendQueue length"),
            "geds_tcptransport_sendqueue_length"
        );
        assert_eq!(prometheus_name("bytes read (s3)"), "bytes_read_s3");
    }

    #[test]
    fn handles_are_shared_per_label() {
        let a = counter("stats test: shared counter");
        let b = counter("stats test: shared counter");
        a.inc_by(2);
        b.inc();
        assert_eq!(a.get(), 3);
    }

    #[test]
    fn gather_exposes_registered_metrics() {
        let gauge = gauge("stats test: exposition gauge");
        gauge.set(42);
        let text = gather();
        assert!(text.contains("stats_test_exposition_gauge 42"));
    }
}
