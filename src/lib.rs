//! Context assembly engine for conversational agents
//!
//! Given a query and the recent conversation, the engine gathers candidate
//! context from episodic, semantic, state, tool and knowledge stores, scores
//! and selects what fits a token budget, compresses overflow and renders a
//! structured context window. See [`context::ContextEngine`].

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use config::Config;
pub use error::{ContextError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::{
        BuildOutcome, ContextEngine, ContextRequest, ContextWindow, ConversationContext,
        ConversationMessage, InMemorySource, OptimizationGoal, OutputFormat, Priority, RawRecord,
        SourceAdapter, SourceKind,
    };
    pub use crate::error::{ContextError, Result};
    pub use crate::telemetry::{init_tracing, TelemetrySink, TracingSink};
}
