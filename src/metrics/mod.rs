//! Metrics collection for observability

use prometheus::{
    register_counter_vec_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry,
};

/// Prometheus metrics for one engine instance
///
/// Each engine owns its own registry so that several engines (per tenant,
/// per test) never collide on metric registration.
pub struct EngineMetrics {
    registry: Registry,

    // Build outcomes
    pub builds: CounterVec,
    pub cache_lookups: CounterVec,
    pub build_duration: Histogram,
    pub stage_duration: HistogramVec,

    // Retrieval
    pub source_failures: CounterVec,
    pub source_duration: HistogramVec,

    // Budget and compression
    pub tokens_used: Histogram,
    pub budget_utilization: Histogram,
    pub compressions: CounterVec,
    pub quality_score: Histogram,
}

impl EngineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let builds = register_counter_vec_with_registry!(
            Opts::new("context_builds_total", "Total context builds by outcome"),
            &["outcome"],
            registry
        )?;

        let cache_lookups = register_counter_vec_with_registry!(
            Opts::new("context_cache_lookups_total", "Context cache lookups by result"),
            &["result"],
            registry
        )?;

        let build_duration = register_histogram_with_registry!(
            "context_build_duration_seconds",
            "End-to-end context build duration in seconds",
            registry
        )?;

        let stage_duration = register_histogram_vec_with_registry!(
            "context_stage_duration_seconds",
            "Pipeline stage duration in seconds",
            &["stage"],
            registry
        )?;

        let source_failures = register_counter_vec_with_registry!(
            Opts::new("context_source_failures_total", "Source adapter failures and timeouts"),
            &["source", "reason"],
            registry
        )?;

        let source_duration = register_histogram_vec_with_registry!(
            "context_source_duration_seconds",
            "Source adapter query duration in seconds",
            &["source"],
            registry
        )?;

        let tokens_used = register_histogram_with_registry!(
            HistogramOpts::new("context_tokens_used", "Tokens in the assembled context").buckets(
                vec![250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0, 32000.0, 64000.0]
            ),
            registry
        )?;

        let budget_utilization = register_histogram_with_registry!(
            HistogramOpts::new("context_budget_utilization", "Used tokens over budget")
                .buckets(vec![0.1, 0.25, 0.5, 0.75, 0.9, 1.0, 1.25, 1.5, 2.0]),
            registry
        )?;

        let compressions = register_counter_vec_with_registry!(
            Opts::new("context_compressions_total", "Segments compressed by method"),
            &["method"],
            registry
        )?;

        let quality_score = register_histogram_with_registry!(
            HistogramOpts::new("context_quality_score", "Overall quality of assembled context")
                .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
            registry
        )?;

        Ok(Self {
            registry,
            builds,
            cache_lookups,
            build_duration,
            stage_duration,
            source_failures,
            source_duration,
            tokens_used,
            budget_utilization,
            compressions,
            quality_score,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished build
    pub fn record_build(&self, outcome: &str, seconds: f64) {
        self.builds.with_label_values(&[outcome]).inc();
        self.build_duration.observe(seconds);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    pub fn record_stage(&self, stage: &str, seconds: f64) {
        self.stage_duration.with_label_values(&[stage]).observe(seconds);
    }

    pub fn record_source_failure(&self, source: &str, reason: &str) {
        self.source_failures.with_label_values(&[source, reason]).inc();
    }

    pub fn record_source_duration(&self, source: &str, seconds: f64) {
        self.source_duration.with_label_values(&[source]).observe(seconds);
    }

    /// Record token usage for an assembled window
    pub fn record_tokens(&self, used: usize, utilization: f32, quality: f32) {
        self.tokens_used.observe(used as f64);
        self.budget_utilization.observe(utilization as f64);
        self.quality_score.observe(quality as f64);
    }

    pub fn record_compression(&self, method: &str) {
        self.compressions.with_label_values(&[method]).inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
