//! Prometheus metrics for the proxy cache

use crate::status::LookupStatus;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Counters for cache lookups, origin traffic and cache writes
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,

    /// Cache lookups by lookup status
    pub lookups_total: CounterVec,

    /// Origin fetches by kind (full, range, revalidation, proxy) and outcome
    pub upstream_fetches_total: CounterVec,

    /// Cache write-backs by result (success/failure)
    pub cache_writes_total: CounterVec,

    /// Bytes sent to clients by source (cache/upstream)
    pub bytes_served_total: CounterVec,

    /// Request handling time by lookup status
    pub request_duration_seconds: HistogramVec,
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics").finish_non_exhaustive()
    }
}

impl CacheMetrics {
    /// Create metrics on a registry of their own
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(&Registry::new())
    }

    /// Create metrics registered on `registry`
    pub fn with_registry(registry: &Registry) -> Result<Self, prometheus::Error> {
        let lookups_total = CounterVec::new(
            Opts::new("object_proxy_cache_lookups_total", "Total number of cache lookups by status"),
            &["status"],
        )?;
        registry.register(Box::new(lookups_total.clone()))?;

        let upstream_fetches_total = CounterVec::new(
            Opts::new(
                "object_proxy_cache_upstream_fetches_total",
                "Total number of origin fetches by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(upstream_fetches_total.clone()))?;

        let cache_writes_total = CounterVec::new(
            Opts::new("object_proxy_cache_writes_total", "Total number of cache writes by result"),
            &["result"],
        )?;
        registry.register(Box::new(cache_writes_total.clone()))?;

        let bytes_served_total = CounterVec::new(
            Opts::new(
                "object_proxy_cache_bytes_served_total",
                "Total response bytes sent to clients by source",
            ),
            &["source"],
        )?;
        registry.register(Box::new(bytes_served_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "object_proxy_cache_request_duration_seconds",
                "Duration of proxied requests in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["status"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            lookups_total,
            upstream_fetches_total,
            cache_writes_total,
            bytes_served_total,
            request_duration_seconds,
        })
    }

    pub fn record_lookup(&self, status: LookupStatus, elapsed: Duration) {
        self.lookups_total.with_label_values(&[status.as_str()]).inc();
        self.request_duration_seconds
            .with_label_values(&[status.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_upstream(&self, kind: &str, status: u16) {
        let outcome = match status {
            200..=399 => "success",
            400..=499 => "client_error",
            _ => "server_error",
        };
        self.upstream_fetches_total.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_upstream_failure(&self, kind: &str) {
        self.upstream_fetches_total.with_label_values(&[kind, "failure"]).inc();
    }

    pub fn record_write(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.cache_writes_total.with_label_values(&[result]).inc();
    }

    pub fn record_bytes(&self, from_cache: bool, bytes: usize) {
        let source = if from_cache { "cache" } else { "upstream" };
        self.bytes_served_total
            .with_label_values(&[source])
            .inc_by(bytes as f64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric of the registry in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
