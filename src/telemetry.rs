//! Structured logging setup and per-build telemetry

use crate::config::LoggingConfig;
use crate::context::models::{OptimizationGoal, SourceKind, StageLatencies};
use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ContextError::Configuration(format!("failed to install tracing subscriber: {}", e)))
}

/// Summary of one `build` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: String,
    pub conversation_id: String,
    pub goal: OptimizationGoal,
    pub token_budget: usize,
    pub total_tokens: usize,
    pub budget_utilization: f32,
    pub quality_score: f32,
    pub sources_used: Vec<SourceKind>,
    pub failed_sources: Vec<String>,
    pub compression_applied: bool,
    pub cache_hit: bool,
    pub fallback: bool,
    /// Error kind that sent the build down the fallback path
    pub fallback_reason: Option<String>,
    pub build_time: Duration,
    pub stage_latencies: StageLatencies,
}

/// Receives one record per finished build
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: &BuildRecord);
}

/// Emits each build as a structured `tracing` event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, record: &BuildRecord) {
        info!(
            build_id = %record.build_id,
            conversation_id = %record.conversation_id,
            goal = record.goal.as_str(),
            token_budget = record.token_budget,
            total_tokens = record.total_tokens,
            budget_utilization = record.budget_utilization,
            quality = record.quality_score,
            sources = record.sources_used.len(),
            failed_sources = ?record.failed_sources,
            compression = record.compression_applied,
            cache_hit = record.cache_hit,
            fallback = record.fallback,
            fallback_reason = record.fallback_reason.as_deref().unwrap_or(""),
            build_ms = record.build_time.as_millis() as u64,
            "context build finished"
        );
    }
}
