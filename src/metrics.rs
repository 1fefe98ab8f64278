use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub method: String,
    pub status: u32,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HitLabels {
    pub mode: HitMode,
}

/// How a cache hit was served: a presigned redirect or a proxied stream.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HitMode {
    Redirect,
    Stream,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Histogram,
    pub cache_hits_total: Family<HitLabels, Counter>,
    pub cache_misses_total: Counter,
    pub upstream_requests_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "ocicache_requests_total",
            "Total HTTP requests by method and status",
            requests_total.clone(),
        );

        let request_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "ocicache_request_duration_seconds",
            "Request latency in seconds",
            request_duration_seconds.clone(),
        );

        let cache_hits_total = Family::<HitLabels, Counter>::default();
        registry.register(
            "ocicache_cache_hits_total",
            "Cache hits by serving mode",
            cache_hits_total.clone(),
        );

        let cache_misses_total = Counter::default();
        registry.register(
            "ocicache_cache_misses_total",
            "Cacheable requests that fell through to upstream",
            cache_misses_total.clone(),
        );

        let upstream_requests_total = Counter::default();
        registry.register(
            "ocicache_upstream_requests_total",
            "Requests forwarded to upstream registries",
            upstream_requests_total.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            cache_hits_total,
            cache_misses_total,
            upstream_requests_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
