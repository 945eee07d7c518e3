//! Data models for context assembly

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ContextError;

/// Memory tier a candidate was retrieved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Conversation,
    Episodic,
    Semantic,
    State,
    Tool,
    Knowledge,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        SourceKind::Conversation,
        SourceKind::Episodic,
        SourceKind::Semantic,
        SourceKind::State,
        SourceKind::Tool,
        SourceKind::Knowledge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Conversation => "conversation",
            SourceKind::Episodic => "episodic",
            SourceKind::Semantic => "semantic",
            SourceKind::State => "state",
            SourceKind::Tool => "tool",
            SourceKind::Knowledge => "knowledge",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ContextError::InvalidRequest(format!("unknown source kind: {}", s)))
    }
}

/// Priority tier for context candidates
///
/// Declared lowest first so that the derived `Ord` ranks `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Optional = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Tiers in the order the optimizer fills them
    pub const DESCENDING: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Optional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Optional => "optional",
        }
    }

    /// Derive a tier from an opaque importance value in [0,1]
    pub fn from_importance(importance: f32) -> Self {
        match importance {
            i if i >= 0.85 => Priority::High,
            i if i >= 0.6 => Priority::Medium,
            i if i >= 0.3 => Priority::Low,
            _ => Priority::Optional,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multi-factor relevance score
///
/// `composite` is fixed at construction and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelevanceScore {
    /// Semantic similarity to the query (0.0-1.0)
    pub semantic_similarity: f32,
    /// Exponential time decay (0.0-1.0)
    pub temporal_relevance: f32,
    /// Importance and access frequency (0.0-1.0)
    pub frequency_importance: f32,
    /// Fit with the ongoing conversation (0.0-1.0)
    pub contextual_fit: f32,
    /// Stored user preference signal (0.0-1.0)
    pub user_preference: f32,
    /// Weighted combination of the above
    pub composite: f32,
}

impl RelevanceScore {
    /// Create a score, computing the composite from the given weights
    pub fn new(
        semantic_similarity: f32,
        temporal_relevance: f32,
        frequency_importance: f32,
        contextual_fit: f32,
        user_preference: f32,
        weights: &ScoringWeights,
    ) -> Self {
        let semantic_similarity = semantic_similarity.clamp(0.0, 1.0);
        let temporal_relevance = temporal_relevance.clamp(0.0, 1.0);
        let frequency_importance = frequency_importance.clamp(0.0, 1.0);
        let contextual_fit = contextual_fit.clamp(0.0, 1.0);
        let user_preference = user_preference.clamp(0.0, 1.0);

        let total_weight = weights.total();
        let composite = if total_weight <= f32::EPSILON {
            0.0
        } else {
            (semantic_similarity * weights.semantic_similarity
                + temporal_relevance * weights.temporal_relevance
                + frequency_importance * weights.frequency_importance
                + contextual_fit * weights.contextual_fit
                + user_preference * weights.user_preference)
                / total_weight
        };

        Self {
            semantic_similarity,
            temporal_relevance,
            frequency_importance,
            contextual_fit,
            user_preference,
            composite: composite.clamp(0.0, 1.0),
        }
    }

    /// Score with every component equal, handy for fixtures
    pub fn uniform(value: f32) -> Self {
        Self::new(value, value, value, value, value, &ScoringWeights::default())
    }
}

/// Non-negative weights for the composite relevance score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    #[serde(default = "default_semantic_weight")]
    pub semantic_similarity: f32,
    #[serde(default = "default_temporal_weight")]
    pub temporal_relevance: f32,
    #[serde(default = "default_frequency_weight")]
    pub frequency_importance: f32,
    #[serde(default = "default_contextual_weight")]
    pub contextual_fit: f32,
    #[serde(default = "default_preference_weight")]
    pub user_preference: f32,
}

fn default_semantic_weight() -> f32 { 0.35 }
fn default_temporal_weight() -> f32 { 0.2 }
fn default_frequency_weight() -> f32 { 0.15 }
fn default_contextual_weight() -> f32 { 0.2 }
fn default_preference_weight() -> f32 { 0.1 }

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            semantic_similarity: default_semantic_weight(),
            temporal_relevance: default_temporal_weight(),
            frequency_importance: default_frequency_weight(),
            contextual_fit: default_contextual_weight(),
            user_preference: default_preference_weight(),
        }
    }
}

impl ScoringWeights {
    pub fn total(&self) -> f32 {
        self.semantic_similarity
            + self.temporal_relevance
            + self.frequency_importance
            + self.contextual_fit
            + self.user_preference
    }

    /// Weights must be finite, non-negative and not all zero
    pub fn validate(&self) -> Result<(), ContextError> {
        let weights = [
            self.semantic_similarity,
            self.temporal_relevance,
            self.frequency_importance,
            self.contextual_fit,
            self.user_preference,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ContextError::Configuration(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        if self.total() <= f32::EPSILON {
            return Err(ContextError::Configuration(
                "scoring weights must not all be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Candidate payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CandidateContent {
    Text(String),
    Structured(serde_json::Value),
}

impl CandidateContent {
    /// Text form used for token estimation, similarity and rendering
    pub fn as_text(&self) -> String {
        match self {
            CandidateContent::Text(text) => text.clone(),
            CandidateContent::Structured(value) => match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// A unit of retrievable context before selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCandidate {
    pub id: String,
    pub source: SourceKind,
    pub content: CandidateContent,
    pub token_estimate: usize,
    pub priority: Priority,
    pub relevance: RelevanceScore,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Stable insertion index within the retrieved pool
    pub position: usize,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ContextCandidate {
    pub fn new(
        id: impl Into<String>,
        source: SourceKind,
        content: CandidateContent,
        token_estimate: usize,
        priority: Priority,
        relevance: RelevanceScore,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            content,
            token_estimate,
            priority,
            relevance,
            created_at,
            last_accessed_at: created_at,
            position: 0,
            metadata: HashMap::new(),
        }
    }

    /// Copy of this candidate with a different priority tier
    pub fn with_priority(&self, priority: Priority) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }

    /// Copy of this candidate at a different pool position
    pub fn at_position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    pub fn with_last_accessed(mut self, last_accessed_at: DateTime<Utc>) -> Self {
        self.last_accessed_at = last_accessed_at;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

/// Selection objective for the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationGoal {
    #[default]
    Balanced,
    RelevanceMax,
    DiversityMax,
    FreshnessMax,
}

impl OptimizationGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationGoal::Balanced => "balanced",
            OptimizationGoal::RelevanceMax => "relevance_max",
            OptimizationGoal::DiversityMax => "diversity_max",
            OptimizationGoal::FreshnessMax => "freshness_max",
        }
    }
}

/// Optimizer output; never edited after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedSelection {
    pub candidates: Vec<ContextCandidate>,
    pub total_tokens: usize,
    pub token_budget: usize,
    /// `total_tokens / token_budget`; above 1.0 only when critical content alone overflows
    pub budget_utilization: f32,
    pub diversity_score: f32,
    pub goal: OptimizationGoal,
    /// Ids of pool members left out
    pub dropped: Vec<String>,
    /// Markup reserved around the selected content when rendered
    #[serde(default)]
    pub layout_tokens: usize,
}

impl OptimizedSelection {
    /// Content plus reserved markup overflows the budget
    pub fn exceeds_budget(&self) -> bool {
        self.total_tokens + self.layout_tokens > self.token_budget
    }

    pub fn ids(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.id.as_str()).collect()
    }
}

/// Compression method applied to a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    None,
    Template,
    Extractive,
    Semantic,
    Truncation,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::None => "none",
            CompressionMethod::Template => "template",
            CompressionMethod::Extractive => "extractive",
            CompressionMethod::Semantic => "semantic",
            CompressionMethod::Truncation => "truncation",
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate text after (possible) compression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedSegment {
    pub source_candidate_id: String,
    pub source: SourceKind,
    pub priority: Priority,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub method: CompressionMethod,
    pub text: String,
    pub relevance: f32,
    pub temporal_relevance: f32,
    pub created_at: DateTime<Utc>,
}

impl CompressedSegment {
    /// Uncompressed segment for a candidate
    pub fn uncompressed(candidate: &ContextCandidate) -> Self {
        Self {
            source_candidate_id: candidate.id.clone(),
            source: candidate.source,
            priority: candidate.priority,
            original_tokens: candidate.token_estimate,
            compressed_tokens: candidate.token_estimate,
            method: CompressionMethod::None,
            text: candidate.text(),
            relevance: candidate.relevance.composite,
            temporal_relevance: candidate.relevance.temporal_relevance,
            created_at: candidate.created_at,
        }
    }

    /// Fraction of the original tokens still present
    pub fn retention(&self) -> f32 {
        if self.original_tokens == 0 {
            1.0
        } else {
            self.compressed_tokens as f32 / self.original_tokens as f32
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Aggregate facts about the retrieved pool, used for quality scoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub candidate_count: usize,
    pub total_relevance: f32,
    pub total_temporal: f32,
    pub source_kinds: BTreeSet<SourceKind>,
    /// Candidates per priority tier, after overrides
    #[serde(default)]
    pub tier_counts: BTreeMap<Priority, usize>,
}

impl PoolSummary {
    pub fn from_candidates(candidates: &[ContextCandidate]) -> Self {
        let mut tier_counts = BTreeMap::new();
        for candidate in candidates {
            *tier_counts.entry(candidate.priority).or_insert(0) += 1;
        }
        Self {
            candidate_count: candidates.len(),
            total_relevance: candidates.iter().map(|c| c.relevance.composite).sum(),
            total_temporal: candidates.iter().map(|c| c.relevance.temporal_relevance).sum(),
            source_kinds: candidates.iter().map(|c| c.source).collect(),
            tier_counts,
        }
    }

    pub fn tier_count(&self, tier: Priority) -> usize {
        self.tier_counts.get(&tier).copied().unwrap_or(0)
    }
}

/// Markup tokens a rendered window spends outside candidate text
///
/// `fixed` covers the envelope and one header per section the pool can
/// produce; `per_item` is the item markup of each candidate, by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutReserve {
    pub fixed: usize,
    pub per_item: HashMap<String, usize>,
}

impl LayoutReserve {
    pub fn item(&self, id: &str) -> usize {
        self.per_item.get(id).copied().unwrap_or(0)
    }

    /// Reserve for a rendered window holding exactly `ids`
    pub fn total_for<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        self.fixed + ids.into_iter().map(|id| self.item(id)).sum::<usize>()
    }
}

/// Six quality sub-scores plus their weighted combination
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityScores {
    pub relevance: f32,
    pub coherence: f32,
    pub completeness: f32,
    pub diversity: f32,
    pub freshness: f32,
    pub token_efficiency: f32,
    pub overall: f32,
}

impl QualityScores {
    /// Cap every sub-score (and the overall score) at `ceiling`
    pub fn capped(self, ceiling: f32) -> Self {
        Self {
            relevance: self.relevance.min(ceiling),
            coherence: self.coherence.min(ceiling),
            completeness: self.completeness.min(ceiling),
            diversity: self.diversity.min(ceiling),
            freshness: self.freshness.min(ceiling),
            token_efficiency: self.token_efficiency.min(ceiling),
            overall: self.overall.min(ceiling),
        }
    }
}

/// Rendering layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Hierarchical markup with ids and attributes
    #[default]
    Verbose,
    /// Delimiter-based layout for small models
    Minimal,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Verbose => "verbose",
            OutputFormat::Minimal => "minimal",
        }
    }
}

/// How segments are grouped into sections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionGrouping {
    #[default]
    BySource,
    ByPriority,
    Flat,
}

/// Labelled group of segments in the final window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSection {
    pub label: String,
    pub segments: Vec<CompressedSegment>,
    pub tokens: usize,
}

/// Final assembled context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub sections: Vec<ContextSection>,
    /// Sum of segment tokens
    pub total_tokens: usize,
    pub token_budget: usize,
    pub budget_utilization: f32,
    pub rendered: String,
    pub rendered_tokens: usize,
    pub quality: QualityScores,
    pub sources_used: Vec<SourceKind>,
    pub build_time: Duration,
    pub format: OutputFormat,
}

impl ContextWindow {
    pub fn quality_score(&self) -> f32 {
        self.quality.overall
    }

    pub fn segments(&self) -> impl Iterator<Item = &CompressedSegment> {
        self.sections.iter().flat_map(|s| s.segments.iter())
    }

    pub fn contains_candidate(&self, id: &str) -> bool {
        self.segments().any(|s| s.source_candidate_id == id)
    }
}

/// A single conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn render(&self) -> String {
        format!("{}: {}", self.role, self.content)
    }
}

/// Conversation identity and recent history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub recent_messages: Vec<ConversationMessage>,
}

impl ConversationContext {
    pub fn new(conversation_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            agent_id: agent_id.into(),
            recent_messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: ConversationMessage) -> Self {
        self.recent_messages.push(message);
        self
    }

    /// The last `k` turns, oldest first
    pub fn last_turns(&self, k: usize) -> &[ConversationMessage] {
        let start = self.recent_messages.len().saturating_sub(k);
        &self.recent_messages[start..]
    }
}

fn default_token_budget() -> usize {
    32_000
}

/// Inbound request from the message-processing pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRequest {
    pub query: String,
    pub conversation: ConversationContext,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default)]
    pub optimization_goal: OptimizationGoal,
    #[serde(default)]
    pub required_sources: Option<Vec<String>>,
    #[serde(default)]
    pub excluded_sources: Option<Vec<String>>,
    /// Candidate id to priority tier
    #[serde(default)]
    pub priority_overrides: HashMap<String, Priority>,
    #[serde(default)]
    pub output_format: Option<OutputFormat>,
    /// Overall deadline for this build
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl ContextRequest {
    pub fn new(query: impl Into<String>, conversation: ConversationContext) -> Self {
        Self {
            query: query.into(),
            conversation,
            token_budget: default_token_budget(),
            optimization_goal: OptimizationGoal::default(),
            required_sources: None,
            excluded_sources: None,
            priority_overrides: HashMap::new(),
            output_format: None,
            deadline: None,
        }
    }

    pub fn with_budget(mut self, token_budget: usize) -> Self {
        self.token_budget = token_budget;
        self
    }

    pub fn with_goal(mut self, goal: OptimizationGoal) -> Self {
        self.optimization_goal = goal;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    /// Check the request is well formed
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.token_budget == 0 {
            return Err(ContextError::InvalidRequest(
                "token_budget must be greater than zero".to_string(),
            ));
        }
        if self.query.trim().is_empty() && self.conversation.recent_messages.is_empty() {
            return Err(ContextError::InvalidRequest(
                "query and recent_messages are both empty".to_string(),
            ));
        }
        for name in self
            .required_sources
            .iter()
            .chain(self.excluded_sources.iter())
            .flatten()
        {
            name.parse::<SourceKind>()?;
        }
        Ok(())
    }
}

/// Per-stage wall-clock timings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLatencies {
    pub retrieval: Duration,
    pub optimization: Duration,
    pub compression: Duration,
    pub structuring: Duration,
}

/// Metadata returned alongside the window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub sources_used: Vec<SourceKind>,
    pub failed_sources: Vec<String>,
    pub compression_applied: bool,
    pub build_time: Duration,
    pub cache_hit: bool,
    pub fallback: bool,
    pub stage_latencies: StageLatencies,
}
