//! Context engine: the single entry point of the assembly pipeline
//!
//! validate → cache lookup → retrieve → optimize → (compress) → structure
//! → cache store → telemetry. Any stage failure, an expired deadline or a
//! cancelled token is answered with the fallback context built from the
//! most recent conversation turns; only malformed requests surface as errors.

use super::cache::{CacheStats, ContextCache};
use super::compressor::ContextCompressor;
use super::models::{
    BuildMetadata, CompressedSegment, CompressionMethod, ContextRequest, ContextWindow,
    ConversationContext, OutputFormat, PoolSummary, Priority, SourceKind, StageLatencies,
};
use super::optimizer::ContextOptimizer;
use super::retriever::ContextRetriever;
use super::scorer::RelevanceScorer;
use super::sources::SourceAdapter;
use super::structurer::ContextStructurer;
use super::token_estimator::{estimator_from_name, TokenEstimator};
use crate::config::Config;
use crate::error::{ContextError, Result};
use crate::metrics::EngineMetrics;
use crate::telemetry::{BuildRecord, TelemetrySink, TracingSink};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one build: the shared window plus how it was produced
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub window: Arc<ContextWindow>,
    pub metadata: BuildMetadata,
}

/// Everything the pipeline produces before caching and telemetry
struct PipelineOutput {
    window: ContextWindow,
    sources_used: Vec<SourceKind>,
    failed_sources: Vec<String>,
    compression_applied: bool,
    stage_latencies: StageLatencies,
}

/// Builder for [`ContextEngine`]
pub struct ContextEngineBuilder {
    config: Config,
    sources: Vec<Arc<dyn SourceAdapter>>,
    estimator: Option<Arc<dyn TokenEstimator>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ContextEngineBuilder {
    pub fn source(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sources(mut self, sources: impl IntoIterator<Item = Arc<dyn SourceAdapter>>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Override the estimator named in `engine.token_estimator`
    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<ContextEngine> {
        let config = self.config;
        config.validate()?;

        let estimator = match self.estimator {
            Some(estimator) => estimator,
            None => estimator_from_name(&config.engine.token_estimator)?,
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                EngineMetrics::new()
                    .map_err(|e| ContextError::Internal(format!("failed to register metrics: {}", e)))?,
            ),
        };
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(TracingSink));

        let scorer = RelevanceScorer::new(config.scoring.clone(), config.retrieval.half_lives.clone());
        let retriever = ContextRetriever::new(
            self.sources,
            scorer,
            Arc::clone(&estimator),
            config.retrieval.clone(),
        )
        .with_metrics(Arc::clone(&metrics));
        let optimizer = ContextOptimizer::new(config.optimizer.clone());
        let compressor = ContextCompressor::new(config.compression.clone(), Arc::clone(&estimator))
            .with_metrics(Arc::clone(&metrics));
        let structurer = ContextStructurer::new(
            config.structure.clone(),
            config.quality.clone(),
            Arc::clone(&estimator),
        );
        let cache = ContextCache::new(&config.cache);

        info!(
            sources = ?retriever.source_names(),
            estimator = estimator.name(),
            cache = cache.is_enabled(),
            "context engine ready"
        );

        Ok(ContextEngine {
            config,
            retriever,
            optimizer,
            compressor,
            structurer,
            estimator,
            cache,
            metrics,
            telemetry,
        })
    }
}

/// Assembles context windows for agent turns
///
/// `Send + Sync`; share it behind an `Arc` and call [`ContextEngine::build`]
/// from as many tasks as needed.
pub struct ContextEngine {
    config: Config,
    retriever: ContextRetriever,
    optimizer: ContextOptimizer,
    compressor: ContextCompressor,
    structurer: ContextStructurer,
    estimator: Arc<dyn TokenEstimator>,
    cache: ContextCache,
    metrics: Arc<EngineMetrics>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ContextEngine {
    pub fn builder(config: Config) -> ContextEngineBuilder {
        ContextEngineBuilder {
            config,
            sources: Vec::new(),
            estimator: None,
            telemetry: None,
            metrics: None,
        }
    }

    /// Engine with default estimator, metrics and tracing telemetry
    pub fn new(config: Config, sources: Vec<Arc<dyn SourceAdapter>>) -> Result<Self> {
        Self::builder(config).sources(sources).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Request carrying the configured default token budget
    pub fn request(&self, query: impl Into<String>, conversation: ConversationContext) -> ContextRequest {
        ContextRequest::new(query, conversation).with_budget(self.config.engine.default_token_budget)
    }

    /// Build a context window for `request`
    pub async fn build(&self, request: ContextRequest) -> Result<BuildOutcome> {
        self.build_with_cancellation(request, CancellationToken::new()).await
    }

    /// Build, abandoning the pipeline for the fallback context when `cancel` fires
    pub async fn build_with_cancellation(
        &self,
        request: ContextRequest,
        cancel: CancellationToken,
    ) -> Result<BuildOutcome> {
        let start = Instant::now();
        let build_id = Uuid::new_v4().to_string();

        if let Err(e) = request.validate() {
            warn!(build_id = %build_id, error = %e, "rejected context request");
            self.metrics.record_build("invalid", start.elapsed().as_secs_f64());
            return Err(e);
        }

        let format = request
            .output_format
            .unwrap_or_else(|| self.structurer.default_format());
        let key = ContextCache::key_for(&request, format, self.config.engine.fingerprint_turns);

        if let Some(window) = self.cache.get(&key).await {
            self.metrics.record_cache_lookup(true);
            debug!(build_id = %build_id, "context cache hit");
            let metadata = BuildMetadata {
                sources_used: window.sources_used.clone(),
                failed_sources: Vec::new(),
                compression_applied: window.segments().any(|s| s.method != CompressionMethod::None),
                build_time: start.elapsed(),
                cache_hit: true,
                fallback: false,
                stage_latencies: StageLatencies::default(),
            };
            return Ok(self.finish(&build_id, &request, window, metadata, None, "cache_hit"));
        }
        if self.cache.is_enabled() {
            self.metrics.record_cache_lookup(false);
        }

        info!(
            build_id = %build_id,
            conversation_id = %request.conversation.conversation_id,
            budget = request.token_budget,
            goal = request.optimization_goal.as_str(),
            "assembling context"
        );

        let deadline = request.deadline.or_else(|| self.config.engine.default_deadline());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ContextError::Cancelled),
            output = with_deadline(self.run_pipeline(&request, format), deadline) => output,
        };

        match result {
            Ok(mut output) => {
                output.window.build_time = start.elapsed();
                let window = Arc::new(output.window);
                self.cache.insert(key, Arc::clone(&window)).await;
                let metadata = BuildMetadata {
                    sources_used: output.sources_used,
                    failed_sources: output.failed_sources,
                    compression_applied: output.compression_applied,
                    build_time: start.elapsed(),
                    cache_hit: false,
                    fallback: false,
                    stage_latencies: output.stage_latencies,
                };
                Ok(self.finish(&build_id, &request, window, metadata, None, "success"))
            }
            Err(e) if e.triggers_fallback() => {
                warn!(build_id = %build_id, error = %e, "pipeline failed, serving fallback context");
                let mut window = self.fallback(&request, format)?;
                window.build_time = start.elapsed();
                let metadata = BuildMetadata {
                    sources_used: window.sources_used.clone(),
                    failed_sources: Vec::new(),
                    compression_applied: window.segments().any(|s| s.method != CompressionMethod::None),
                    build_time: start.elapsed(),
                    cache_hit: false,
                    fallback: true,
                    stage_latencies: StageLatencies::default(),
                };
                Ok(self.finish(&build_id, &request, Arc::new(window), metadata, Some(&e), "fallback"))
            }
            Err(e) => {
                self.metrics.record_build("invalid", start.elapsed().as_secs_f64());
                Err(e)
            }
        }
    }

    /// Drop every cached window
    pub fn invalidate_cache(&self) {
        info!("invalidating context cache");
        self.cache.invalidate_all();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn run_pipeline(&self, request: &ContextRequest, format: OutputFormat) -> Result<PipelineOutput> {
        let mut latencies = StageLatencies::default();

        let stage = Instant::now();
        let pool = self
            .retriever
            .retrieve(
                &request.query,
                &request.conversation,
                request.required_sources.as_deref(),
                request.excluded_sources.as_deref(),
            )
            .await?;
        latencies.retrieval = self.stage_done("retrieval", stage);

        let stage = Instant::now();
        let candidates = ContextOptimizer::apply_overrides(&pool.candidates, &request.priority_overrides);
        let summary = PoolSummary::from_candidates(&candidates);
        let layout = self.structurer.layout_reserve(&candidates, format);
        let selection = self.optimizer.optimize_with_layout(
            &candidates,
            request.token_budget,
            request.optimization_goal,
            &request.priority_overrides,
            &layout,
        )?;
        latencies.optimization = self.stage_done("optimization", stage);

        let stage = Instant::now();
        let segments = if selection.exceeds_budget() {
            self.compressor.compress(&selection, request.token_budget)?
        } else {
            selection.candidates.iter().map(CompressedSegment::uncompressed).collect()
        };
        let compression_applied = segments.iter().any(|s| s.method != CompressionMethod::None);
        latencies.compression = self.stage_done("compression", stage);

        let stage = Instant::now();
        let window = self
            .structurer
            .structure(segments, format, &summary, request.token_budget)?;
        latencies.structuring = self.stage_done("structuring", stage);

        debug!(
            selected = selection.candidates.len(),
            dropped = selection.dropped.len(),
            total_tokens = window.total_tokens,
            quality = window.quality.overall,
            "pipeline finished"
        );

        Ok(PipelineOutput {
            window,
            sources_used: pool.sources_used,
            failed_sources: pool.failed_sources,
            compression_applied,
            stage_latencies: latencies,
        })
    }

    fn stage_done(&self, name: &str, started: Instant) -> Duration {
        let elapsed = started.elapsed();
        self.metrics.record_stage(name, elapsed.as_secs_f64());
        elapsed
    }

    /// Last `fallback_turns` turns, oldest dropped first to fit the budget
    ///
    /// The newest turn is critical: if it cannot fit on its own it only gets
    /// template cleanup and the window reports utilisation above 1.0.
    fn fallback(&self, request: &ContextRequest, format: OutputFormat) -> Result<ContextWindow> {
        let turns = request.conversation.last_turns(self.config.engine.fallback_turns);
        let offset = request.conversation.recent_messages.len() - turns.len();

        let mut segments: Vec<CompressedSegment> = turns
            .iter()
            .enumerate()
            .map(|(idx, message)| {
                let text = message.render();
                let tokens = self.estimator.estimate(&text);
                CompressedSegment {
                    source_candidate_id: format!("conversation:turn-{}", offset + idx),
                    source: SourceKind::Conversation,
                    priority: if idx + 1 == turns.len() {
                        Priority::Critical
                    } else {
                        Priority::High
                    },
                    original_tokens: tokens,
                    compressed_tokens: tokens,
                    method: CompressionMethod::None,
                    text,
                    relevance: 1.0,
                    temporal_relevance: 1.0,
                    created_at: message.timestamp,
                }
            })
            .collect();

        let mut tier_counts = BTreeMap::new();
        for segment in &segments {
            *tier_counts.entry(segment.priority).or_insert(0) += 1;
        }
        let pool = PoolSummary {
            candidate_count: segments.len(),
            total_relevance: segments.len() as f32,
            total_temporal: segments.len() as f32,
            source_kinds: segments.iter().map(|s| s.source).collect(),
            tier_counts,
        };

        let budget = request.token_budget;
        let layout = self.structurer.segment_layout(&segments, format);
        let rendered_size = |segments: &[CompressedSegment]| {
            layout.fixed
                + segments
                    .iter()
                    .map(|s| s.compressed_tokens + layout.item(&s.source_candidate_id))
                    .sum::<usize>()
        };

        while rendered_size(&segments) > budget && segments.len() > 1 {
            segments.remove(0);
        }
        if rendered_size(&segments) > budget {
            let reserved = layout.total_for(segments.iter().map(|s| s.source_candidate_id.as_str()));
            let content_budget = budget.saturating_sub(reserved).max(1);
            segments = self.compressor.compress_segments(segments, content_budget)?;
        }

        let mut window = self.structurer.structure(segments, format, &pool, budget)?;
        window.quality = window.quality.capped(self.config.engine.fallback_quality);
        Ok(window)
    }

    fn finish(
        &self,
        build_id: &str,
        request: &ContextRequest,
        window: Arc<ContextWindow>,
        metadata: BuildMetadata,
        fallback_reason: Option<&ContextError>,
        outcome: &str,
    ) -> BuildOutcome {
        self.metrics.record_build(outcome, metadata.build_time.as_secs_f64());
        self.metrics
            .record_tokens(window.total_tokens, window.budget_utilization, window.quality.overall);

        self.telemetry.record(&BuildRecord {
            build_id: build_id.to_string(),
            conversation_id: request.conversation.conversation_id.clone(),
            goal: request.optimization_goal,
            token_budget: request.token_budget,
            total_tokens: window.total_tokens,
            budget_utilization: window.budget_utilization,
            quality_score: window.quality.overall,
            sources_used: metadata.sources_used.clone(),
            failed_sources: metadata.failed_sources.clone(),
            compression_applied: metadata.compression_applied,
            cache_hit: metadata.cache_hit,
            fallback: metadata.fallback,
            fallback_reason: fallback_reason.map(|e| e.kind().to_string()),
            build_time: metadata.build_time,
            stage_latencies: metadata.stage_latencies.clone(),
        });

        BuildOutcome { window, metadata }
    }
}

/// Run `future` under an optional deadline
async fn with_deadline<T>(
    future: impl Future<Output = Result<T>>,
    deadline: Option<Duration>,
) -> Result<T> {
    match deadline {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| ContextError::DeadlineExceeded(limit))?,
        None => future.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::ConversationMessage;
    use crate::context::sources::{InMemorySource, QueryFilters, RawRecord, SourceError};
    use crate::context::token_estimator::WordBasedEstimator;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct NeverSource;

    #[async_trait]
    impl SourceAdapter for NeverSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Knowledge
        }

        async fn query(
            &self,
            _text: &str,
            _filters: &QueryFilters,
            _limit: usize,
        ) -> std::result::Result<Vec<RawRecord>, SourceError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<BuildRecord>>);

    impl TelemetrySink for CollectingSink {
        fn record(&self, record: &BuildRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    fn conversation() -> ConversationContext {
        ConversationContext::new("conv-1", "agent-1")
            .with_message(ConversationMessage::new("user", "how do we deploy"))
            .with_message(ConversationMessage::new("assistant", "through the pipeline"))
            .with_message(ConversationMessage::new("user", "and rollbacks"))
    }

    fn semantic_source() -> Arc<dyn SourceAdapter> {
        Arc::new(InMemorySource::new("semantic", SourceKind::Semantic).with_records(vec![
            RawRecord::new("s1", "rollbacks use the previous release tag", 0.7),
            RawRecord::new("s2", "deploys run through the release pipeline", 0.6),
        ]))
    }

    fn engine_with(sources: Vec<Arc<dyn SourceAdapter>>, sink: Arc<CollectingSink>) -> ContextEngine {
        ContextEngine::builder(Config::default())
            .sources(sources)
            .estimator(Arc::new(WordBasedEstimator::new(1.0)))
            .telemetry(sink)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_assembles_window() {
        let sink = Arc::new(CollectingSink::default());
        let engine = engine_with(vec![semantic_source()], sink.clone());
        let outcome = engine
            .build(ContextRequest::new("rollbacks", conversation()).with_budget(1000))
            .await
            .unwrap();

        assert!(!outcome.metadata.fallback);
        assert!(!outcome.metadata.cache_hit);
        assert!(outcome.window.contains_candidate("semantic:s1"));
        assert!(outcome.window.contains_candidate("conversation:turn-2"));
        assert!(outcome.window.total_tokens <= 1000);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_is_surfaced() {
        let engine = engine_with(vec![semantic_source()], Arc::new(CollectingSink::default()));
        let err = engine
            .build(ContextRequest::new("q", conversation()).with_budget(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidRequest(_)));

        let empty = ContextRequest::new("  ", ConversationContext::new("c", "a"));
        assert!(matches!(engine.build(empty).await, Err(ContextError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_second_build_hits_cache() {
        let engine = engine_with(vec![semantic_source()], Arc::new(CollectingSink::default()));
        let request = ContextRequest::new("rollbacks", conversation()).with_budget(1000);
        let first = engine.build(request.clone()).await.unwrap();
        let second = engine.build(request).await.unwrap();

        assert!(second.metadata.cache_hit);
        assert!(Arc::ptr_eq(&first.window, &second.window));
        assert_eq!(engine.cache_stats().hits, 1);

        engine.invalidate_cache();
        let third = engine
            .build(ContextRequest::new("rollbacks", conversation()).with_budget(1000))
            .await
            .unwrap();
        assert!(!third.metadata.cache_hit);
    }

    #[tokio::test]
    async fn test_cancellation_serves_fallback() {
        let sink = Arc::new(CollectingSink::default());
        let engine = engine_with(vec![Arc::new(NeverSource)], sink.clone());
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = engine
            .build_with_cancellation(ContextRequest::new("q", conversation()).with_budget(1000), token)
            .await
            .unwrap();
        assert!(outcome.metadata.fallback);
        assert!(outcome.window.quality_score() <= 0.3);
        assert_eq!(
            sink.0.lock().unwrap()[0].fallback_reason.as_deref(),
            Some("cancelled")
        );
    }

    #[tokio::test]
    async fn test_deadline_serves_fallback_and_is_not_cached() {
        let engine = engine_with(vec![Arc::new(NeverSource)], Arc::new(CollectingSink::default()));
        let request = ContextRequest::new("q", conversation())
            .with_budget(1000)
            .with_deadline(Duration::from_millis(30));

        let first = engine.build(request.clone()).await.unwrap();
        assert!(first.metadata.fallback);
        let second = engine.build(request).await.unwrap();
        assert!(!second.metadata.cache_hit);
        assert!(second.metadata.fallback);
    }

    #[tokio::test]
    async fn test_fallback_drops_oldest_turns_to_fit() {
        let engine = engine_with(vec![Arc::new(NeverSource)], Arc::new(CollectingSink::default()));
        // Turns render as 5, 4 and 3 words; the two newest need 27 tokens
        // with their markup (envelope 2, section 4, items 7 each)
        let request = ContextRequest::new("q", conversation())
            .with_budget(27)
            .with_deadline(Duration::from_millis(30));
        let outcome = engine.build(request).await.unwrap();

        assert!(outcome.metadata.fallback);
        assert!(!outcome.window.contains_candidate("conversation:turn-0"));
        assert!(outcome.window.contains_candidate("conversation:turn-1"));
        assert!(outcome.window.contains_candidate("conversation:turn-2"));
        assert_eq!(outcome.window.total_tokens, 7);
        assert!(outcome.window.rendered_tokens <= 27);
    }

    #[tokio::test]
    async fn test_fallback_never_truncates_the_latest_turn() {
        let engine = engine_with(vec![Arc::new(NeverSource)], Arc::new(CollectingSink::default()));
        let long_turn = (0..20).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let conversation = ConversationContext::new("conv-2", "agent-1")
            .with_message(ConversationMessage::new("user", long_turn.clone()));
        let request = ContextRequest::new("q", conversation)
            .with_budget(5)
            .with_deadline(Duration::from_millis(30));
        let outcome = engine.build(request).await.unwrap();

        assert!(outcome.metadata.fallback);
        let latest = outcome.window.segments().next().unwrap();
        assert_eq!(latest.priority, Priority::Critical);
        assert_ne!(latest.method, CompressionMethod::Truncation);
        assert_eq!(latest.text, format!("user: {}", long_turn));
        assert_eq!(latest.compressed_tokens, 21);
        assert!(outcome.window.budget_utilization > 1.0);
    }
}
