//! Engine configuration
//!
//! Supplied by the host process at construction time. Every field has a
//! default, so an empty TOML file (or none at all) yields a working engine.
//! Values can be overridden with `CONTEXT__<SECTION>__<FIELD>` environment
//! variables.

use crate::context::models::{OutputFormat, Priority, ScoringWeights, SectionGrouping, SourceKind};
use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub scoring: ScoringWeights,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub structure: StructureConfig,
    #[serde(default)]
    pub quality: QualityWeights,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load from an optional TOML file plus `CONTEXT__` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("CONTEXT")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.scoring.validate()?;
        self.optimizer.balanced_weights.validate()?;
        self.quality.validate()?;

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ContextError::Configuration(
                "cache.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            return Err(ContextError::Configuration(
                "cache.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.default_timeout_ms == 0
            || self.retrieval.source_timeouts_ms.values().any(|t| *t == 0)
        {
            return Err(ContextError::Configuration(
                "retrieval timeouts must be greater than zero".to_string(),
            ));
        }
        if self.retrieval.per_source_limit == 0 {
            return Err(ContextError::Configuration(
                "retrieval.per_source_limit must be greater than zero".to_string(),
            ));
        }
        for ratio in [
            self.compression.extractive_keep_ratio,
            self.compression.high_priority_keep_ratio,
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ContextError::Configuration(format!(
                    "compression keep ratio {} must be in (0, 1]",
                    ratio
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.engine.fallback_quality) {
            return Err(ContextError::Configuration(
                "engine.fallback_quality must be in [0, 1]".to_string(),
            ));
        }
        if self.optimizer.selection_headroom < 0.0 {
            return Err(ContextError::Configuration(
                "optimizer.selection_headroom must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_token_budget")]
    pub default_token_budget: usize,

    /// Conversation turns kept by the fallback context
    #[serde(default = "default_fallback_turns")]
    pub fallback_turns: usize,

    /// Quality ceiling reported for fallback contexts
    #[serde(default = "default_fallback_quality")]
    pub fallback_quality: f32,

    /// Turns hashed into the cache key
    #[serde(default = "default_fingerprint_turns")]
    pub fingerprint_turns: usize,

    /// Deadline applied when a request carries none
    #[serde(default)]
    pub default_deadline_ms: Option<u64>,

    /// Token estimator: "word" or "tiktoken"
    #[serde(default = "default_estimator")]
    pub token_estimator: String,
}

fn default_token_budget() -> usize { 32_000 }
fn default_fallback_turns() -> usize { 5 }
fn default_fallback_quality() -> f32 { 0.3 }
fn default_fingerprint_turns() -> usize { 3 }
fn default_estimator() -> String { "word".to_string() }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_token_budget: default_token_budget(),
            fallback_turns: default_fallback_turns(),
            fallback_quality: default_fallback_quality(),
            fingerprint_turns: default_fingerprint_turns(),
            default_deadline_ms: None,
            token_estimator: default_estimator(),
        }
    }
}

impl EngineConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_cache_enabled() -> bool { true }
fn default_cache_entries() -> u64 { 1000 }
fn default_cache_ttl() -> u64 { 300 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Half-life (hours) for temporal decay, per source kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalfLives {
    #[serde(default = "default_conversation_half_life")]
    pub conversation: f64,
    #[serde(default = "default_episodic_half_life")]
    pub episodic: f64,
    #[serde(default = "default_semantic_half_life")]
    pub semantic: f64,
    #[serde(default = "default_state_half_life")]
    pub state: f64,
    #[serde(default = "default_tool_half_life")]
    pub tool: f64,
    #[serde(default = "default_knowledge_half_life")]
    pub knowledge: f64,
}

fn default_conversation_half_life() -> f64 { 1.0 }
fn default_episodic_half_life() -> f64 { 72.0 }
fn default_semantic_half_life() -> f64 { 720.0 }
fn default_state_half_life() -> f64 { 8760.0 }
fn default_tool_half_life() -> f64 { 24.0 }
fn default_knowledge_half_life() -> f64 { 2160.0 }

impl Default for HalfLives {
    fn default() -> Self {
        Self {
            conversation: default_conversation_half_life(),
            episodic: default_episodic_half_life(),
            semantic: default_semantic_half_life(),
            state: default_state_half_life(),
            tool: default_tool_half_life(),
            knowledge: default_knowledge_half_life(),
        }
    }
}

impl HalfLives {
    pub fn hours(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Conversation => self.conversation,
            SourceKind::Episodic => self.episodic,
            SourceKind::Semantic => self.semantic,
            SourceKind::State => self.state,
            SourceKind::Tool => self.tool,
            SourceKind::Knowledge => self.knowledge,
        }
    }
}

/// Retriever settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Per-source overrides keyed by adapter name
    #[serde(default)]
    pub source_timeouts_ms: HashMap<String, u64>,

    #[serde(default = "default_min_sources")]
    pub min_successful_sources: usize,

    #[serde(default = "default_per_source_limit")]
    pub per_source_limit: usize,

    #[serde(default)]
    pub half_lives: HalfLives,

    /// Episodic records older than this many half-lives are dropped
    #[serde(default = "default_episodic_window")]
    pub episodic_window_half_lives: f64,

    #[serde(default = "default_critical_turns")]
    pub critical_recent_turns: usize,

    #[serde(default = "default_high_turns")]
    pub high_recent_turns: usize,

    /// Conversation turns turned into candidates
    #[serde(default = "default_conversation_limit")]
    pub conversation_turn_limit: usize,
}

fn default_timeout_ms() -> u64 { 2000 }
fn default_min_sources() -> usize { 1 }
fn default_per_source_limit() -> usize { 20 }
fn default_episodic_window() -> f64 { 5.0 }
fn default_critical_turns() -> usize { 1 }
fn default_high_turns() -> usize { 2 }
fn default_conversation_limit() -> usize { 20 }

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            source_timeouts_ms: HashMap::new(),
            min_successful_sources: default_min_sources(),
            per_source_limit: default_per_source_limit(),
            half_lives: HalfLives::default(),
            episodic_window_half_lives: default_episodic_window(),
            critical_recent_turns: default_critical_turns(),
            high_recent_turns: default_high_turns(),
            conversation_turn_limit: default_conversation_limit(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout_for(&self, source_name: &str) -> Duration {
        Duration::from_millis(
            self.source_timeouts_ms
                .get(source_name)
                .copied()
                .unwrap_or(self.default_timeout_ms),
        )
    }
}

/// Bonus added to the balanced score per priority tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityBonus {
    #[serde(default = "default_critical_bonus")]
    pub critical: f32,
    #[serde(default = "default_high_bonus")]
    pub high: f32,
    #[serde(default = "default_medium_bonus")]
    pub medium: f32,
    #[serde(default = "default_low_bonus")]
    pub low: f32,
    #[serde(default)]
    pub optional: f32,
}

fn default_critical_bonus() -> f32 { 1.0 }
fn default_high_bonus() -> f32 { 0.6 }
fn default_medium_bonus() -> f32 { 0.3 }
fn default_low_bonus() -> f32 { 0.1 }

impl Default for PriorityBonus {
    fn default() -> Self {
        Self {
            critical: default_critical_bonus(),
            high: default_high_bonus(),
            medium: default_medium_bonus(),
            low: default_low_bonus(),
            optional: 0.0,
        }
    }
}

impl PriorityBonus {
    pub fn for_priority(&self, priority: Priority) -> f32 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Medium => self.medium,
            Priority::Low => self.low,
            Priority::Optional => self.optional,
        }
    }
}

/// Optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Component weights for the balanced goal
    #[serde(default)]
    pub balanced_weights: ScoringWeights,

    #[serde(default)]
    pub priority_bonus: PriorityBonus,

    /// Weight of the token-efficiency bonus in the balanced goal
    #[serde(default = "default_efficiency_bonus")]
    pub efficiency_bonus: f32,

    /// Over-selection allowed ahead of compression, as a fraction of the budget
    #[serde(default)]
    pub selection_headroom: f32,
}

fn default_efficiency_bonus() -> f32 { 0.05 }

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            balanced_weights: ScoringWeights::default(),
            priority_bonus: PriorityBonus::default(),
            efficiency_bonus: default_efficiency_bonus(),
            selection_headroom: 0.0,
        }
    }
}

/// Compressor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Phrases removed by template compression (matched case-insensitively)
    #[serde(default = "default_boilerplate")]
    pub boilerplate_phrases: Vec<String>,

    /// Fraction of sentences kept by extractive summarization (medium/low)
    #[serde(default = "default_keep_ratio")]
    pub extractive_keep_ratio: f32,

    /// Fraction of sentences kept for high-priority candidates
    #[serde(default = "default_high_keep_ratio")]
    pub high_priority_keep_ratio: f32,

    /// Concepts kept by semantic compression
    #[serde(default = "default_max_concepts")]
    pub max_concepts: usize,
}

fn default_boilerplate() -> Vec<String> {
    [
        "please note that",
        "it is important to note that",
        "as mentioned earlier,",
        "as previously mentioned,",
        "needless to say,",
        "for what it's worth,",
        "in other words,",
        "basically,",
        "to be honest,",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_keep_ratio() -> f32 { 0.5 }
fn default_high_keep_ratio() -> f32 { 0.7 }
fn default_max_concepts() -> usize { 12 }

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            boilerplate_phrases: default_boilerplate(),
            extractive_keep_ratio: default_keep_ratio(),
            high_priority_keep_ratio: default_high_keep_ratio(),
            max_concepts: default_max_concepts(),
        }
    }
}

/// Structurer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureConfig {
    #[serde(default)]
    pub grouping: SectionGrouping,
    #[serde(default)]
    pub default_format: OutputFormat,
}

/// Weights of the six quality sub-scores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityWeights {
    #[serde(default = "default_q_relevance")]
    pub relevance: f32,
    #[serde(default = "default_q_coherence")]
    pub coherence: f32,
    #[serde(default = "default_q_completeness")]
    pub completeness: f32,
    #[serde(default = "default_q_diversity")]
    pub diversity: f32,
    #[serde(default = "default_q_freshness")]
    pub freshness: f32,
    #[serde(default = "default_q_efficiency")]
    pub token_efficiency: f32,
}

fn default_q_relevance() -> f32 { 0.3 }
fn default_q_coherence() -> f32 { 0.15 }
fn default_q_completeness() -> f32 { 0.15 }
fn default_q_diversity() -> f32 { 0.1 }
fn default_q_freshness() -> f32 { 0.1 }
fn default_q_efficiency() -> f32 { 0.2 }

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            relevance: default_q_relevance(),
            coherence: default_q_coherence(),
            completeness: default_q_completeness(),
            diversity: default_q_diversity(),
            freshness: default_q_freshness(),
            token_efficiency: default_q_efficiency(),
        }
    }
}

impl QualityWeights {
    pub fn total(&self) -> f32 {
        self.relevance
            + self.coherence
            + self.completeness
            + self.diversity
            + self.freshness
            + self.token_efficiency
    }

    pub fn validate(&self) -> Result<()> {
        let weights = [
            self.relevance,
            self.coherence,
            self.completeness,
            self.diversity,
            self.freshness,
            self.token_efficiency,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) || self.total() <= f32::EPSILON {
            return Err(ContextError::Configuration(
                "quality weights must be non-negative and not all zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
