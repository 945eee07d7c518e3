//! Example: assembling context for an agent turn
//!
//! Wires in-memory stores into a `ContextEngine`, builds a window for a
//! query and prints the rendered context plus build metadata.
//!
//! Run with: cargo run --example assemble_context [config.toml]

use chrono::{Duration, Utc};
use context_assembly::prelude::*;
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    init_tracing(&config.logging)?;

    let now = Utc::now();
    let episodic = InMemorySource::new("episodic", SourceKind::Episodic).with_records(vec![
        RawRecord::new("deploy-incident", "Last Friday's deploy failed because the migration locked the orders table.", 0.8)
            .with_timestamp(now - Duration::days(3)),
        RawRecord::new("standup", "The team agreed to ship the billing service behind a feature flag.", 0.5)
            .with_timestamp(now - Duration::hours(20)),
    ]);
    let semantic = InMemorySource::new("semantic", SourceKind::Semantic).with_records(vec![
        RawRecord::new("migrations", "Run schema migrations in a separate job before rolling out new pods.", 0.7)
            .with_similarity(0.82),
        RawRecord::new("flags", "Feature flags are managed in the config service and default to off.", 0.4),
    ]);
    let state = InMemorySource::new("state", SourceKind::State).with_records(vec![
        RawRecord::new("role", "on-call engineer", 0.9)
            .with_priority(Priority::Critical)
            .with_metadata("key", "role"),
    ]);
    let tools = InMemorySource::new("tool", SourceKind::Tool).with_records(vec![
        RawRecord::new("kubectl", "", 0.6).with_payload(json!({
            "tool": "kubectl",
            "last_result": "deployment/billing rolled out 3/3 replicas",
        })),
    ]);

    let sources: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(episodic),
        Arc::new(semantic),
        Arc::new(state),
        Arc::new(tools),
    ];
    let engine = ContextEngine::new(config, sources)?;

    let conversation = ConversationContext::new("conv-demo", "ops-agent")
        .with_message(ConversationMessage::new("user", "We need to deploy billing today."))
        .with_message(ConversationMessage::new("assistant", "Is the schema migration ready?"))
        .with_message(ConversationMessage::new("user", "Yes. How should we roll out the deploy safely?"));

    let request = engine
        .request("how should we roll out the billing deploy", conversation)
        .with_budget(400)
        .with_goal(OptimizationGoal::Balanced);

    let outcome = engine.build(request.clone()).await?;
    println!("{}", outcome.window.rendered);
    println!();
    println!(
        "tokens: {}/{} (utilization {:.2}), quality {:.2}, sources {:?}, compression {}, fallback {}",
        outcome.window.total_tokens,
        outcome.window.token_budget,
        outcome.window.budget_utilization,
        outcome.window.quality_score(),
        outcome.metadata.sources_used,
        outcome.metadata.compression_applied,
        outcome.metadata.fallback,
    );

    // Same request again is served from the cache
    let cached = engine.build(request.with_format(OutputFormat::Verbose)).await?;
    println!("second build cache hit: {}", cached.metadata.cache_hit);
    println!("cache: {:?}", engine.cache_stats());

    println!();
    println!("{}", engine.metrics().export_prometheus());

    Ok(())
}
