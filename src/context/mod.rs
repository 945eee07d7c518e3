//! Context assembly pipeline
//!
//! Retrieval from heterogeneous memory sources, budgeted selection,
//! priority-aware compression and structured rendering, orchestrated by
//! [`ContextEngine`].

pub mod cache;
pub mod compressor;
pub mod engine;
pub mod models;
pub mod optimizer;
pub mod retriever;
pub mod scorer;
pub mod sources;
pub mod structurer;
pub mod text;
pub mod token_budget;
pub mod token_estimator;

pub use cache::{CacheStats, ContextCache};
pub use compressor::ContextCompressor;
pub use engine::{BuildOutcome, ContextEngine, ContextEngineBuilder};
pub use models::{
    BuildMetadata, CandidateContent, CompressedSegment, CompressionMethod, ContextCandidate,
    ContextRequest, ContextSection, ContextWindow, ConversationContext, ConversationMessage,
    LayoutReserve, OptimizationGoal, OptimizedSelection, OutputFormat, PoolSummary, Priority,
    QualityScores, RelevanceScore, ScoringWeights, SectionGrouping, SourceKind, StageLatencies,
};
pub use optimizer::ContextOptimizer;
pub use retriever::{ContextRetriever, RetrievedPool};
pub use scorer::{RelevanceScorer, ScoringContext};
pub use sources::{InMemorySource, QueryFilters, RawRecord, SourceAdapter, SourceError};
pub use structurer::ContextStructurer;
pub use token_budget::TokenBudget;
pub use token_estimator::{estimator_from_name, TiktokenEstimator, TokenEstimator, WordBasedEstimator};
