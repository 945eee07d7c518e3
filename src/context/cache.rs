//! Result cache for assembled context windows (TTL + LRU)

use super::models::{ContextRequest, ContextWindow, OutputFormat};
use crate::config::CacheConfig;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Approximate; eviction bookkeeping runs lazily
    pub entries: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Engine-owned cache of finished windows
///
/// Entries are immutable once inserted and shared as `Arc<ContextWindow>`.
pub struct ContextCache {
    inner: Option<Cache<String, Arc<ContextWindow>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContextCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl())
                .eviction_policy(EvictionPolicy::lru())
                .build()
        });
        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Look up a window; disabled caches always miss
    pub async fn get(&self, key: &str) -> Option<Arc<ContextWindow>> {
        let found = match &self.inner {
            Some(cache) => cache.get(key).await,
            None => None,
        };
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub async fn insert(&self, key: String, window: Arc<ContextWindow>) {
        if let Some(cache) = &self.inner {
            debug!(key = %key, "caching context window");
            cache.insert(key, window).await;
        }
    }

    pub fn invalidate_all(&self) {
        if let Some(cache) = &self.inner {
            cache.invalidate_all();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.as_ref().map(|c| c.entry_count()).unwrap_or(0),
        }
    }

    /// SHA-256 key over everything that shapes the window: normalised query,
    /// conversation id, the last `fingerprint_turns` turns, budget, goal,
    /// format, source filters and priority overrides
    pub fn key_for(request: &ContextRequest, format: OutputFormat, fingerprint_turns: usize) -> String {
        let mut hasher = Sha256::new();
        let mut field = |value: &str| {
            hasher.update(value.as_bytes());
            hasher.update([0x1fu8]);
        };

        let query = request
            .query
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        field(&query);
        field(&request.conversation.conversation_id);
        for message in request.conversation.last_turns(fingerprint_turns) {
            field(&message.role);
            field(&message.content);
        }
        field(&request.token_budget.to_string());
        field(request.optimization_goal.as_str());
        field(format.as_str());

        let mut required = request.required_sources.clone().unwrap_or_default();
        required.sort();
        field(&format!("required={}", required.join(",")));
        let mut excluded = request.excluded_sources.clone().unwrap_or_default();
        excluded.sort();
        field(&format!("excluded={}", excluded.join(",")));

        let mut overrides: Vec<String> = request
            .priority_overrides
            .iter()
            .map(|(id, priority)| format!("{}={}", id, priority))
            .collect();
        overrides.sort();
        field(&overrides.join(","));

        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::{
        ConversationContext, ConversationMessage, OptimizationGoal, Priority, QualityScores,
    };
    use std::time::Duration;

    fn request(query: &str) -> ContextRequest {
        let conversation = ConversationContext::new("conv-1", "agent-1")
            .with_message(ConversationMessage::new("user", "hello"))
            .with_message(ConversationMessage::new("assistant", "hi"));
        ContextRequest::new(query, conversation).with_budget(1000)
    }

    fn window() -> Arc<ContextWindow> {
        Arc::new(ContextWindow {
            sections: Vec::new(),
            total_tokens: 0,
            token_budget: 1000,
            budget_utilization: 0.0,
            rendered: "<context>\n</context>".to_string(),
            rendered_tokens: 2,
            quality: QualityScores::default(),
            sources_used: Vec::new(),
            build_time: Duration::from_millis(3),
            format: OutputFormat::Verbose,
        })
    }

    #[test]
    fn test_key_normalises_query() {
        let a = ContextCache::key_for(&request("Deploy  the   Service"), OutputFormat::Verbose, 3);
        let b = ContextCache::key_for(&request("deploy the service"), OutputFormat::Verbose, 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_separates_requests() {
        let base = ContextCache::key_for(&request("q"), OutputFormat::Verbose, 3);
        assert_ne!(base, ContextCache::key_for(&request("q").with_budget(2000), OutputFormat::Verbose, 3));
        assert_ne!(
            base,
            ContextCache::key_for(&request("q").with_goal(OptimizationGoal::FreshnessMax), OutputFormat::Verbose, 3)
        );
        assert_ne!(base, ContextCache::key_for(&request("q"), OutputFormat::Minimal, 3));

        let mut newer = request("q");
        newer.conversation = newer
            .conversation
            .with_message(ConversationMessage::new("user", "one more"));
        assert_ne!(base, ContextCache::key_for(&newer, OutputFormat::Verbose, 3));

        let mut pinned = request("q");
        pinned.priority_overrides.insert("episodic:e1".into(), Priority::Critical);
        assert_ne!(base, ContextCache::key_for(&pinned, OutputFormat::Verbose, 3));
    }

    #[tokio::test]
    async fn test_round_trip_and_stats() {
        let cache = ContextCache::new(&CacheConfig::default());
        assert!(cache.get("k").await.is_none());

        let stored = window();
        cache.insert("k".to_string(), stored.clone()).await;
        let hit = cache.get("k").await.unwrap();
        assert_eq!(*hit, *stored);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = ContextCache::new(&CacheConfig::default());
        cache.insert("k".to_string(), window()).await;
        cache.invalidate_all();
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_always_misses() {
        let cache = ContextCache::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        cache.insert("k".to_string(), window()).await;
        assert!(cache.get("k").await.is_none());
        assert!(!cache.is_enabled());
    }
}
