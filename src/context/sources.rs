//! Candidate source adapters
//!
//! Every memory tier (episodic store, vector store, agent state, tool
//! results, ...) is reached through the same narrow [`SourceAdapter`]
//! trait. Adapters return raw records; the retriever normalises them into
//! scored candidates.

use super::models::{Priority, SourceKind};
use super::text;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Record returned by an external store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque importance or confidence value (0.0-1.0)
    pub importance: f32,
    /// Store-computed similarity to the query, when the store has one
    #[serde(default)]
    pub similarity: Option<f32>,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    /// Tier requested by the store, overriding the importance-derived one
    #[serde(default)]
    pub priority: Option<Priority>,
    /// Structured payload; rendered instead of `content` when present
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RawRecord {
    pub fn new(id: impl Into<String>, content: impl Into<String>, importance: f32) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            importance,
            similarity: None,
            access_count: 0,
            last_accessed: None,
            priority: None,
            payload: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_similarity(mut self, similarity: f32) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_access_count(mut self, access_count: u32) -> Self {
        self.access_count = access_count;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Filters passed through to a store query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub conversation_id: Option<String>,
    pub agent_id: Option<String>,
    /// Only records at or after this instant
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Source adapter errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Uniform query interface over a memory tier
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Memory tier this adapter serves
    fn kind(&self) -> SourceKind;

    /// Adapter name used for timeouts, logs and metrics
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Query the store for records related to `text`
    async fn query(
        &self,
        text: &str,
        filters: &QueryFilters,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError>;
}

/// In-process adapter backed by a vector of records
///
/// Similarity is lexical (word-set overlap), which is enough for tests,
/// demos and small static tiers such as agent configuration.
pub struct InMemorySource {
    name: String,
    kind: SourceKind,
    records: RwLock<Vec<RawRecord>>,
}

impl InMemorySource {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn with_records(self, records: Vec<RawRecord>) -> Self {
        if let Ok(mut guard) = self.records.write() {
            guard.extend(records);
        }
        self
    }

    /// Add a record to the store
    pub fn insert(&self, record: RawRecord) -> Result<(), SourceError> {
        let mut guard = self
            .records
            .write()
            .map_err(|e| SourceError::Unavailable(format!("lock poisoned: {}", e)))?;
        guard.push(record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SourceAdapter for InMemorySource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn query(
        &self,
        query: &str,
        filters: &QueryFilters,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let guard = self
            .records
            .read()
            .map_err(|e| SourceError::Unavailable(format!("lock poisoned: {}", e)))?;

        let query_terms = text::term_set(query);
        let mut matches: Vec<(usize, RawRecord)> = guard
            .iter()
            .filter(|r| filters.since.map_or(true, |since| r.timestamp >= since))
            .filter(|r| {
                filters
                    .metadata
                    .iter()
                    .all(|(k, v)| r.metadata.get(k) == Some(v))
            })
            .cloned()
            .enumerate()
            .map(|(idx, mut record)| {
                if record.similarity.is_none() {
                    let terms = text::term_set(&record.content);
                    record.similarity = Some(text::jaccard(&query_terms, &terms));
                }
                (idx, record)
            })
            .collect();

        // Highest similarity first, insertion order on ties
        matches.sort_by(|(ia, a), (ib, b)| {
            let sa = a.similarity.unwrap_or(0.0);
            let sb = b.similarity.unwrap_or(0.0);
            sb.total_cmp(&sa).then(ia.cmp(ib))
        });
        matches.truncate(limit);

        debug!(
            source = %self.name,
            returned = matches.len(),
            "in-memory source answered query"
        );

        Ok(matches.into_iter().map(|(_, r)| r).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn store() -> InMemorySource {
        InMemorySource::new("facts", SourceKind::Semantic).with_records(vec![
            RawRecord::new("a", "rust borrow checker rules", 0.5),
            RawRecord::new("b", "python garbage collection", 0.5),
            RawRecord::new("c", "rust async runtime tokio", 0.5),
        ])
    }

    #[tokio::test]
    async fn test_query_ranks_by_lexical_similarity() {
        let records = store()
            .query("rust async", &QueryFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(records[0].id, "c");
        assert_eq!(records[1].id, "a");
        assert!(records[0].similarity.unwrap() > records[1].similarity.unwrap());
    }

    #[tokio::test]
    async fn test_query_respects_limit_and_since() {
        let source = InMemorySource::new("episodes", SourceKind::Episodic);
        source
            .insert(RawRecord::new("old", "old event", 0.5).with_timestamp(Utc::now() - ChronoDuration::days(10)))
            .unwrap();
        source.insert(RawRecord::new("new", "new event", 0.5)).unwrap();

        let filters = QueryFilters {
            since: Some(Utc::now() - ChronoDuration::days(1)),
            ..QueryFilters::default()
        };
        let records = source.query("event", &filters, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "new");

        let limited = source.query("event", &QueryFilters::default(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_store_similarity_is_kept() {
        let source = InMemorySource::new("vectors", SourceKind::Semantic)
            .with_records(vec![RawRecord::new("v", "unrelated", 0.5).with_similarity(0.93)]);
        let records = source.query("rust", &QueryFilters::default(), 5).await.unwrap();
        assert_eq!(records[0].similarity, Some(0.93));
    }
}
