use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, Opts, Registry, TextEncoder};

/// Shared metrics registry for operator and remote-execution telemetry.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_batches: CounterVec,
    operator_steps: CounterVec,
    series_loaded: CounterVec,
    selector_cache_hits: CounterVec,
    selector_cache_misses: CounterVec,
    remote_queries: CounterVec,
    remote_query_errors: CounterVec,
}

impl MetricsRegistry {
    /// Create a registry with all FMQ collectors registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record one emitted batch and the number of step-vectors it carried.
    pub fn record_operator_batch(&self, operator: &str, steps: u64) {
        self.inner
            .operator_batches
            .with_label_values(&[operator])
            .inc();
        self.inner
            .operator_steps
            .with_label_values(&[operator])
            .inc_by(steps as f64);
    }

    /// Record the series count produced by one storage enumeration.
    pub fn record_series_loaded(&self, operator: &str, series: u64) {
        self.inner
            .series_loaded
            .with_label_values(&[operator])
            .inc_by(series as f64);
    }

    /// Record a selector-cache lookup outcome.
    pub fn record_selector_cache(&self, hit: bool) {
        let vec = if hit {
            &self.inner.selector_cache_hits
        } else {
            &self.inner.selector_cache_misses
        };
        vec.with_label_values(&["selector"]).inc();
    }

    /// Record one dispatched remote query and whether it failed.
    pub fn record_remote_query(&self, engine: &str, failed: bool) {
        self.inner.remote_queries.with_label_values(&[engine]).inc();
        if failed {
            self.inner
                .remote_query_errors
                .with_label_values(&[engine])
                .inc();
        }
    }

    /// Render all collectors in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&metric_families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_batches = CounterVec::new(
            Opts::new("fmq_operator_batches_total", "Batches emitted per operator"),
            &["operator"],
        )
        .expect("valid metric definition");
        let operator_steps = CounterVec::new(
            Opts::new(
                "fmq_operator_steps_total",
                "Step-vectors emitted per operator",
            ),
            &["operator"],
        )
        .expect("valid metric definition");
        let series_loaded = CounterVec::new(
            Opts::new(
                "fmq_series_loaded_total",
                "Series returned by storage enumerations",
            ),
            &["operator"],
        )
        .expect("valid metric definition");
        let selector_cache_hits = CounterVec::new(
            Opts::new("fmq_selector_cache_hits_total", "Selector cache hits"),
            &["cache"],
        )
        .expect("valid metric definition");
        let selector_cache_misses = CounterVec::new(
            Opts::new("fmq_selector_cache_misses_total", "Selector cache misses"),
            &["cache"],
        )
        .expect("valid metric definition");
        let remote_queries = CounterVec::new(
            Opts::new("fmq_remote_queries_total", "Remote queries dispatched"),
            &["engine"],
        )
        .expect("valid metric definition");
        let remote_query_errors = CounterVec::new(
            Opts::new("fmq_remote_query_errors_total", "Remote query failures"),
            &["engine"],
        )
        .expect("valid metric definition");

        for c in [
            &operator_batches,
            &operator_steps,
            &series_loaded,
            &selector_cache_hits,
            &selector_cache_misses,
            &remote_queries,
            &remote_query_errors,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("collector registers once");
        }

        Self {
            registry,
            operator_batches,
            operator_steps,
            series_loaded,
            selector_cache_hits,
            selector_cache_misses,
            remote_queries,
            remote_query_errors,
        }
    }
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

/// Process-global metrics handle shared by all engine components.
pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
