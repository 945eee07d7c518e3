//! Parallel multi-source retrieval
//!
//! Fans a query out to every enabled [`SourceAdapter`] at once, each with
//! its own timeout, and normalises whatever comes back into a single scored
//! candidate pool. A slow or failing source is logged and left out; the call
//! only fails when fewer than `min_successful_sources` adapters answer.

use super::models::{
    CandidateContent, ContextCandidate, ConversationContext, PoolSummary, Priority, SourceKind,
};
use super::scorer::{RelevanceScorer, ScoringContext};
use super::sources::{QueryFilters, RawRecord, SourceAdapter, SourceError};
use super::token_estimator::TokenEstimator;
use crate::config::RetrievalConfig;
use crate::error::{ContextError, Result};
use crate::metrics::EngineMetrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Scored candidates from one retrieval pass
#[derive(Debug, Clone)]
pub struct RetrievedPool {
    pub candidates: Vec<ContextCandidate>,
    pub sources_used: Vec<SourceKind>,
    pub failed_sources: Vec<String>,
    pub summary: PoolSummary,
}

/// Outcome of querying one adapter
enum SourceOutcome {
    Records(Vec<RawRecord>),
    Failed(ContextError),
}

/// Fans queries out to all sources and builds the candidate pool
pub struct ContextRetriever {
    sources: Vec<Arc<dyn SourceAdapter>>,
    scorer: RelevanceScorer,
    estimator: Arc<dyn TokenEstimator>,
    config: RetrievalConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ContextRetriever {
    pub fn new(
        sources: Vec<Arc<dyn SourceAdapter>>,
        scorer: RelevanceScorer,
        estimator: Arc<dyn TokenEstimator>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            sources,
            scorer,
            estimator,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Query every enabled source concurrently and return the scored pool
    pub async fn retrieve(
        &self,
        query: &str,
        conversation: &ConversationContext,
        required_sources: Option<&[String]>,
        excluded_sources: Option<&[String]>,
    ) -> Result<RetrievedPool> {
        let enabled = Self::enabled_kinds(required_sources, excluded_sources)?;
        let now = Utc::now();
        let ctx = ScoringContext::new(
            query,
            conversation
                .last_turns(self.config.conversation_turn_limit)
                .iter()
                .map(|m| m.content.as_str()),
            now,
        );

        let active: Vec<&Arc<dyn SourceAdapter>> = self
            .sources
            .iter()
            .filter(|s| enabled.contains(&s.kind()))
            .collect();

        debug!(
            sources = active.len(),
            "fanning out retrieval across {} sources",
            active.len()
        );

        let queries = active.iter().map(|source| {
            let filters = self.filters_for(source.kind(), conversation, now);
            self.query_source(Arc::clone(source), query, filters)
        });
        let outcomes = join_all(queries).await;

        let attempted = active.len();
        let mut failed_sources = Vec::new();
        let mut batches: Vec<(String, SourceKind, Vec<RawRecord>)> = Vec::new();

        for (source, outcome) in active.iter().zip(outcomes) {
            match outcome {
                SourceOutcome::Records(records) => {
                    batches.push((source.name().to_string(), source.kind(), records));
                }
                SourceOutcome::Failed(err) => {
                    warn!(source = source.name(), error = %err, "source omitted from pool");
                    failed_sources.push(source.name().to_string());
                }
            }
        }

        let required_successes = self.config.min_successful_sources.min(attempted);
        if batches.len() < required_successes {
            return Err(ContextError::AllSourcesFailed { attempted });
        }

        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        let mut sources_used = BTreeSet::new();

        for (name, kind, records) in batches {
            for record in records {
                if kind == SourceKind::Episodic
                    && self.scorer.age_in_half_lives(kind, record.timestamp, now)
                        > self.config.episodic_window_half_lives
                {
                    continue;
                }
                let candidate = self.normalize(&name, kind, record, &ctx);
                if seen.insert(candidate.id.clone()) {
                    sources_used.insert(kind);
                    candidates.push(candidate);
                }
            }
        }

        if enabled.contains(&SourceKind::Conversation) {
            for candidate in self.conversation_candidates(conversation, &ctx) {
                if seen.insert(candidate.id.clone()) {
                    sources_used.insert(SourceKind::Conversation);
                    candidates.push(candidate);
                }
            }
        }

        let candidates: Vec<ContextCandidate> = candidates
            .into_iter()
            .enumerate()
            .map(|(position, c)| c.at_position(position))
            .collect();

        info!(
            candidates = candidates.len(),
            failed = failed_sources.len(),
            "retrieved candidate pool"
        );

        Ok(RetrievedPool {
            summary: PoolSummary::from_candidates(&candidates),
            candidates,
            sources_used: sources_used.into_iter().collect(),
            failed_sources,
        })
    }

    /// Run one adapter query under its own deadline
    async fn query_source(
        &self,
        source: Arc<dyn SourceAdapter>,
        query: &str,
        filters: QueryFilters,
    ) -> SourceOutcome {
        let name = source.name().to_string();
        let timeout = self.config.timeout_for(&name);
        let start = Instant::now();

        let result = tokio::time::timeout(
            timeout,
            source.query(query, &filters, self.config.per_source_limit),
        )
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_source_duration(&name, start.elapsed().as_secs_f64());
        }

        let (reason, label) = match result {
            Ok(Ok(records)) => return SourceOutcome::Records(records),
            Ok(Err(err)) => (err.to_string(), Self::failure_label(&err)),
            Err(_) => (format!("timed out after {:?}", timeout), "timeout"),
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_source_failure(&name, label);
        }
        SourceOutcome::Failed(ContextError::SourceUnavailable {
            source_name: name,
            reason,
        })
    }

    fn failure_label(err: &SourceError) -> &'static str {
        match err {
            SourceError::Unavailable(_) => "unavailable",
            SourceError::QueryFailed(_) => "query_failed",
            SourceError::InvalidRecord(_) => "invalid_record",
        }
    }

    /// Source kinds to query after applying required/excluded lists
    fn enabled_kinds(
        required_sources: Option<&[String]>,
        excluded_sources: Option<&[String]>,
    ) -> Result<HashSet<SourceKind>> {
        let mut enabled: HashSet<SourceKind> = match required_sources {
            Some(names) if !names.is_empty() => names
                .iter()
                .map(|n| n.parse::<SourceKind>())
                .collect::<Result<_>>()?,
            _ => SourceKind::ALL.iter().copied().collect(),
        };
        for name in excluded_sources.unwrap_or_default() {
            enabled.remove(&name.parse::<SourceKind>()?);
        }
        Ok(enabled)
    }

    fn filters_for(
        &self,
        kind: SourceKind,
        conversation: &ConversationContext,
        now: DateTime<Utc>,
    ) -> QueryFilters {
        let since = match kind {
            SourceKind::Episodic => {
                let window_hours =
                    self.config.half_lives.episodic * self.config.episodic_window_half_lives;
                Some(now - ChronoDuration::milliseconds((window_hours * 3_600_000.0) as i64))
            }
            _ => None,
        };
        QueryFilters {
            conversation_id: Some(conversation.conversation_id.clone()),
            agent_id: Some(conversation.agent_id.clone()),
            since,
            ..QueryFilters::default()
        }
    }

    /// Turn a raw record into a scored candidate
    fn normalize(
        &self,
        source_name: &str,
        kind: SourceKind,
        record: RawRecord,
        ctx: &ScoringContext,
    ) -> ContextCandidate {
        let relevance = self.scorer.score(&record, kind, ctx);
        let priority = record
            .priority
            .unwrap_or_else(|| Priority::from_importance(record.importance));
        let content = match record.payload {
            Some(payload) => CandidateContent::Structured(payload),
            None => CandidateContent::Text(record.content),
        };
        let token_estimate = self.estimator.estimate(&content.as_text());

        ContextCandidate::new(
            format!("{}:{}", source_name, record.id),
            kind,
            content,
            token_estimate,
            priority,
            relevance,
            record.timestamp,
        )
        .with_last_accessed(record.last_accessed.unwrap_or(record.timestamp))
        .with_metadata(record.metadata)
    }

    /// Recent turns from the request; the newest ones are critical
    fn conversation_candidates(
        &self,
        conversation: &ConversationContext,
        ctx: &ScoringContext,
    ) -> Vec<ContextCandidate> {
        let turns = conversation.last_turns(self.config.conversation_turn_limit);
        let offset = conversation.recent_messages.len() - turns.len();
        let critical = self.config.critical_recent_turns;
        let high = critical + self.config.high_recent_turns;

        turns
            .iter()
            .enumerate()
            .map(|(idx, message)| {
                let age_rank = turns.len() - 1 - idx;
                let priority = if age_rank < critical {
                    Priority::Critical
                } else if age_rank < high {
                    Priority::High
                } else {
                    Priority::Medium
                };
                let record = RawRecord::new(
                    format!("turn-{}", offset + idx),
                    message.render(),
                    0.5,
                )
                .with_timestamp(message.timestamp)
                .with_priority(priority)
                .with_metadata("role", message.role.clone());
                self.normalize("conversation", SourceKind::Conversation, record, ctx)
            })
            .collect()
    }
}
