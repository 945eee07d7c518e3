//! Multi-factor relevance scoring

use super::models::{RelevanceScore, ScoringWeights, SourceKind};
use super::sources::RawRecord;
use super::text;
use crate::config::HalfLives;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Query-side inputs shared by every record scored in one request
#[derive(Debug, Clone)]
pub struct ScoringContext {
    pub query_terms: BTreeSet<String>,
    pub conversation_terms: BTreeSet<String>,
    pub now: DateTime<Utc>,
}

impl ScoringContext {
    pub fn new<'a>(
        query: &str,
        recent_turns: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> Self {
        let conversation_terms = recent_turns
            .into_iter()
            .flat_map(text::term_set)
            .collect();
        Self {
            query_terms: text::term_set(query),
            conversation_terms,
            now,
        }
    }
}

/// Computes a [`RelevanceScore`] for raw records
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    weights: ScoringWeights,
    half_lives: HalfLives,
}

impl RelevanceScorer {
    pub fn new(weights: ScoringWeights, half_lives: HalfLives) -> Self {
        Self {
            weights,
            half_lives,
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Exponential decay `exp(-Δt / half_life)`; future timestamps count as now
    pub fn temporal_relevance(&self, kind: SourceKind, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        let half_life_hours = self.half_lives.hours(kind);
        if half_life_hours <= 0.0 {
            return 0.0;
        }
        let age_hours = (now - timestamp).num_milliseconds().max(0) as f64 / 3_600_000.0;
        (-age_hours / half_life_hours).exp() as f32
    }

    /// Age, in half-lives, of a timestamp
    pub fn age_in_half_lives(&self, kind: SourceKind, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let half_life_hours = self.half_lives.hours(kind);
        if half_life_hours <= 0.0 {
            return f64::INFINITY;
        }
        let age_hours = (now - timestamp).num_milliseconds().max(0) as f64 / 3_600_000.0;
        age_hours / half_life_hours
    }

    /// Score a record retrieved from `kind`
    pub fn score(&self, record: &RawRecord, kind: SourceKind, ctx: &ScoringContext) -> RelevanceScore {
        let content_terms = text::term_set(&record.content);

        let semantic_similarity = match (kind, record.similarity) {
            (SourceKind::State, _) if Self::key_matches(record, &ctx.query_terms) => 1.0,
            (_, Some(similarity)) => similarity,
            (_, None) => text::jaccard(&ctx.query_terms, &content_terms),
        };

        let temporal_relevance = self.temporal_relevance(kind, record.timestamp, ctx.now);

        let access = 1.0 - (-(record.access_count as f32) / 5.0).exp();
        let frequency_importance = 0.6 * record.importance.clamp(0.0, 1.0) + 0.4 * access;

        let contextual_fit = text::coverage(&content_terms, &ctx.conversation_terms);

        let user_preference = record
            .metadata
            .get("preference")
            .and_then(|p| p.parse::<f32>().ok())
            .unwrap_or(0.5);

        RelevanceScore::new(
            semantic_similarity,
            temporal_relevance,
            frequency_importance,
            contextual_fit,
            user_preference,
            &self.weights,
        )
    }

    /// Direct field lookup for agent state: the record's `key` names a query term
    fn key_matches(record: &RawRecord, query_terms: &BTreeSet<String>) -> bool {
        record
            .metadata
            .get("key")
            .map(|key| query_terms.contains(&key.to_lowercase()))
            .unwrap_or(false)
    }
}
