//! # Prometheus Metrics: Exposition for Scraping
//!
//! Exposes gatehouse operational metrics in the OpenMetrics text format at
//! `/metrics`.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `gatehouse_http_request_duration_seconds` | Histogram | `method`, `path` | Request latency |
//! | `gatehouse_rate_limited_requests_total` | Counter | - | Mutations rejected by the limiter |
//! | `gatehouse_audit_write_failures_total` | Counter | - | Audit appends that failed after a mutation |
//! | `gatehouse_gate_evaluations_total` | Counter | `verdict` | Gate evaluations by overall result |
//! | `gatehouse_artifact_presigns_total` | Counter | `method` | Presigned URLs issued |
//!
//! Paths are normalized before labelling (UUIDs and numeric ids collapse to
//! placeholders) so label cardinality stays bounded.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct VerdictLabel {
    pub verdict: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct MethodLabel {
    pub method: String,
}

fn request_histogram() -> Histogram {
    // 1 ms .. ~16 s
    Histogram::new(exponential_buckets(0.001, 2.0, 15))
}

/// Thread-safe metrics registry. Every field is atomic and may be updated
/// from any task.
pub struct Metrics {
    pub registry: Registry,
    pub http_request_duration: Family<HttpLabel, Histogram, fn() -> Histogram>,
    pub rate_limited: Counter,
    pub audit_write_failures: Counter,
    pub gate_evaluations: Family<VerdictLabel, Counter>,
    pub artifact_presigns: Family<MethodLabel, Counter>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_request_duration =
            Family::<HttpLabel, Histogram, fn() -> Histogram>::new_with_constructor(
                request_histogram,
            );
        registry.register(
            "gatehouse_http_request_duration_seconds",
            "HTTP request latency by method and normalized path",
            http_request_duration.clone(),
        );

        let rate_limited = Counter::default();
        registry.register(
            "gatehouse_rate_limited_requests",
            "Mutating requests rejected by the rate limiter",
            rate_limited.clone(),
        );

        let audit_write_failures = Counter::default();
        registry.register(
            "gatehouse_audit_write_failures",
            "Audit log appends that failed after a successful mutation",
            audit_write_failures.clone(),
        );

        let gate_evaluations = Family::<VerdictLabel, Counter>::default();
        registry.register(
            "gatehouse_gate_evaluations",
            "Gate evaluations by overall verdict",
            gate_evaluations.clone(),
        );

        let artifact_presigns = Family::<MethodLabel, Counter>::default();
        registry.register(
            "gatehouse_artifact_presigns",
            "Presigned artifact URLs issued by HTTP method",
            artifact_presigns.clone(),
        );

        Self {
            registry,
            http_request_duration,
            rate_limited,
            audit_write_failures,
            gate_evaluations,
            artifact_presigns,
        }
    }

    pub fn record_gate_verdict(&self, overall: bool) {
        let verdict = if overall { "pass" } else { "fail" };
        self.gate_evaluations
            .get_or_create(&VerdictLabel {
                verdict: verdict.to_string(),
            })
            .inc();
    }

    pub fn record_presign(&self, method: &str) {
        self.artifact_presigns
            .get_or_create(&MethodLabel {
                method: method.to_string(),
            })
            .inc();
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
