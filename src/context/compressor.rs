//! Priority-aware compression of an over-budget selection
//!
//! Stages run from least to most aggressive. Each stage visits segments
//! lowest priority first and stops as soon as the running total fits.

use super::models::{CompressedSegment, CompressionMethod, OptimizedSelection, Priority};
use super::text;
use super::token_budget::TokenBudget;
use super::token_estimator::TokenEstimator;
use crate::config::CompressionConfig;
use crate::error::{ContextError, Result};
use crate::metrics::EngineMetrics;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// One pass of the compression cascade: a method and the tiers it may touch
struct Stage {
    method: CompressionMethod,
    tiers: &'static [Priority],
}

const STAGES: [Stage; 4] = [
    Stage {
        method: CompressionMethod::Template,
        tiers: &[
            Priority::Optional,
            Priority::Low,
            Priority::Medium,
            Priority::High,
            Priority::Critical,
        ],
    },
    Stage {
        method: CompressionMethod::Extractive,
        tiers: &[Priority::Low, Priority::Medium, Priority::High],
    },
    Stage {
        method: CompressionMethod::Semantic,
        tiers: &[Priority::Optional],
    },
    Stage {
        method: CompressionMethod::Truncation,
        tiers: &[Priority::Optional, Priority::Low, Priority::Medium, Priority::High],
    },
];

/// Squeezes selected content under the token budget
pub struct ContextCompressor {
    config: CompressionConfig,
    estimator: Arc<dyn TokenEstimator>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl ContextCompressor {
    pub fn new(config: CompressionConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            config,
            estimator,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Compress a selection so that it fits `token_budget` where possible
    ///
    /// The markup reserved by the selection is taken off the budget first.
    /// Within budget, every segment comes back with method `none`.
    pub fn compress(&self, selection: &OptimizedSelection, token_budget: usize) -> Result<Vec<CompressedSegment>> {
        let segments = selection
            .candidates
            .iter()
            .map(CompressedSegment::uncompressed)
            .collect();
        let content_budget = token_budget.saturating_sub(selection.layout_tokens).max(1);
        self.compress_segments(segments, content_budget)
    }

    /// Run the cascade over existing segments; a fitting list is returned as is
    pub fn compress_segments(
        &self,
        mut segments: Vec<CompressedSegment>,
        token_budget: usize,
    ) -> Result<Vec<CompressedSegment>> {
        let budget = TokenBudget::new(token_budget)?;
        let mut total: usize = segments.iter().map(|s| s.compressed_tokens).sum();
        if budget.is_within(total) {
            return Ok(segments);
        }

        debug!(
            total_tokens = total,
            budget = token_budget,
            segments = segments.len(),
            "compressing over-budget selection"
        );

        'stages: for stage in &STAGES {
            for &tier in stage.tiers {
                let members: Vec<usize> = (0..segments.len())
                    .filter(|&i| segments[i].priority == tier)
                    .collect();
                for idx in members {
                    if budget.is_within(total) {
                        break 'stages;
                    }
                    let saved = self.apply(&mut segments[idx], stage.method, budget.excess(total));
                    total -= saved;
                }
            }
        }

        if !budget.is_within(total) {
            warn!(
                error = %budget.infeasible(total),
                "selection still over budget after compression"
            );
        }
        Ok(segments)
    }

    /// Apply one method to a segment, returning the tokens saved.
    /// Failures and non-shrinking results leave the segment untouched.
    fn apply(&self, segment: &mut CompressedSegment, method: CompressionMethod, excess: usize) -> usize {
        let attempt = match method {
            CompressionMethod::None => return 0,
            CompressionMethod::Template => self.template(&segment.text),
            CompressionMethod::Extractive => {
                let ratio = if segment.priority == Priority::High {
                    self.config.high_priority_keep_ratio
                } else {
                    self.config.extractive_keep_ratio
                };
                self.extractive(&segment.text, ratio)
            }
            CompressionMethod::Semantic => self.semantic(&segment.text),
            CompressionMethod::Truncation => {
                let target = segment.compressed_tokens.saturating_sub(excess);
                Ok(self.truncate(&segment.text, target))
            }
        };

        let compressed = match attempt {
            Ok(compressed) => compressed,
            Err(e) => {
                debug!(id = %segment.source_candidate_id, error = %e, "compression method skipped");
                return 0;
            }
        };

        let tokens = self.estimator.estimate(&compressed);
        if tokens >= segment.compressed_tokens {
            return 0;
        }

        let saved = segment.compressed_tokens - tokens;
        segment.text = compressed;
        segment.compressed_tokens = tokens;
        segment.method = method;
        if let Some(metrics) = &self.metrics {
            metrics.record_compression(method.as_str());
        }
        saved
    }

    /// Strip decoration, boilerplate phrases and duplicate lines, then
    /// collapse whitespace. Repeated until the text stops changing.
    pub fn template(&self, input: &str) -> Result<String> {
        let mut current = input.to_string();
        loop {
            let next = self.template_pass(&current);
            if next == current {
                break;
            }
            current = next;
        }

        if current.trim().is_empty() {
            return Err(ContextError::CompressionFailure {
                method: CompressionMethod::Template.to_string(),
                reason: "nothing left after removing boilerplate".to_string(),
            });
        }
        Ok(current)
    }

    fn template_pass(&self, input: &str) -> String {
        let undecorated = input
            .lines()
            .filter(|line| !is_decoration(line))
            .map(|line| line.replace("**", ""))
            .collect::<Vec<_>>()
            .join("\n");

        let mut stripped = undecorated;
        for phrase in &self.config.boilerplate_phrases {
            stripped = remove_phrase(&stripped, phrase);
        }

        let normalized = text::normalize_whitespace(&stripped);
        let mut seen = HashSet::new();
        normalized
            .lines()
            .filter(|line| seen.insert(line.to_lowercase()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Keep the top `keep_ratio` of sentences, ranked by position, density
    /// of repeated terms and length, in their original order
    pub fn extractive(&self, input: &str, keep_ratio: f32) -> Result<String> {
        let sentences = text::split_sentences(input);
        let fail = |reason: &str| ContextError::CompressionFailure {
            method: CompressionMethod::Extractive.to_string(),
            reason: reason.to_string(),
        };
        if sentences.len() < 2 {
            return Err(fail("fewer than two sentences"));
        }

        let keep = ((sentences.len() as f32 * keep_ratio.clamp(0.0, 1.0)).ceil() as usize).max(1);
        if keep >= sentences.len() {
            return Err(fail("keep ratio retains every sentence"));
        }

        // Terms repeated across the text mark its topic
        let mut frequency: HashMap<String, usize> = HashMap::new();
        for word in text::words(input).filter(|w| !text::is_stopword(w)) {
            *frequency.entry(word).or_insert(0) += 1;
        }
        let keywords: HashSet<String> = frequency
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(word, _)| word)
            .collect();
        let count = sentences.len() as f32;
        let mut ranked: Vec<(usize, f32)> = sentences
            .iter()
            .enumerate()
            .map(|(idx, sentence)| {
                let words: Vec<String> = text::words(sentence).collect();
                let density = if words.is_empty() {
                    0.0
                } else {
                    words.iter().filter(|w| keywords.contains(*w)).count() as f32 / words.len() as f32
                };
                let position = 1.0 - idx as f32 / count;
                let length = (words.len() as f32 / 20.0).min(1.0);
                (idx, 0.4 * position + 0.4 * density + 0.2 * length)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut kept: Vec<usize> = ranked.into_iter().take(keep).map(|(idx, _)| idx).collect();
        kept.sort_unstable();
        Ok(kept
            .into_iter()
            .map(|idx| sentences[idx].as_str())
            .collect::<Vec<_>>()
            .join(" "))
    }

    /// Rebuild the text as a list of its key concepts
    pub fn semantic(&self, input: &str) -> Result<String> {
        let concepts = text::top_terms(input, self.config.max_concepts);
        if concepts.is_empty() {
            return Err(ContextError::CompressionFailure {
                method: CompressionMethod::Semantic.to_string(),
                reason: "no key concepts found".to_string(),
            });
        }
        Ok(format!("Key concepts: {}", concepts.join(", ")))
    }

    /// Longest sentence prefix within `target` tokens, else the longest word
    /// prefix; may be empty
    pub fn truncate(&self, input: &str, target: usize) -> String {
        if target == 0 {
            return String::new();
        }
        if self.estimator.estimate(input) <= target {
            return input.to_string();
        }

        let mut by_sentence = String::new();
        for sentence in text::split_sentences(input) {
            let candidate = if by_sentence.is_empty() {
                sentence
            } else {
                format!("{} {}", by_sentence, sentence)
            };
            if self.estimator.estimate(&candidate) > target {
                break;
            }
            by_sentence = candidate;
        }
        if !by_sentence.is_empty() {
            return by_sentence;
        }

        // Largest word count whose prefix still fits
        let words: Vec<&str> = input.split_whitespace().collect();
        let (mut lo, mut hi) = (0usize, words.len());
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            if self.estimator.estimate(&words[..mid].join(" ")) <= target {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        words[..lo].join(" ")
    }
}

/// A line made only of rule or bullet decoration characters
fn is_decoration(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && trimmed.chars().all(|c| matches!(c, '-' | '=' | '*' | '_' | '#' | '~' | '`' | '+'))
}

/// Remove every ASCII case-insensitive occurrence of `phrase`
fn remove_phrase(input: &str, phrase: &str) -> String {
    let needle = phrase.to_ascii_lowercase();
    if needle.is_empty() {
        return input.to_string();
    }
    let mut current = input.to_string();
    while let Some(start) = current.to_ascii_lowercase().find(&needle) {
        current.replace_range(start..start + needle.len(), "");
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::{
        CandidateContent, ContextCandidate, OptimizationGoal, RelevanceScore, SourceKind,
    };
    use crate::context::token_estimator::WordBasedEstimator;
    use chrono::Utc;

    fn compressor() -> ContextCompressor {
        ContextCompressor::new(CompressionConfig::default(), Arc::new(WordBasedEstimator::new(1.0)))
    }

    fn candidate(id: &str, priority: Priority, text: &str) -> ContextCandidate {
        let tokens = text.split_whitespace().count();
        ContextCandidate::new(
            id,
            SourceKind::Semantic,
            CandidateContent::Text(text.to_string()),
            tokens,
            priority,
            RelevanceScore::uniform(0.5),
            Utc::now(),
        )
    }

    fn selection(candidates: Vec<ContextCandidate>, budget: usize) -> OptimizedSelection {
        let total_tokens = candidates.iter().map(|c| c.token_estimate).sum();
        OptimizedSelection {
            candidates,
            total_tokens,
            token_budget: budget,
            budget_utilization: total_tokens as f32 / budget as f32,
            diversity_score: 1.0,
            goal: OptimizationGoal::Balanced,
            dropped: Vec::new(),
            layout_tokens: 0,
        }
    }

    fn numbered_words(prefix: &str, n: usize) -> String {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_within_budget_is_untouched() {
        let sel = selection(vec![candidate("a", Priority::Medium, "short text here")], 100);
        let segments = compressor().compress(&sel, 100).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].method, CompressionMethod::None);
        assert_eq!(segments[0].text, "short text here");
    }

    #[test]
    fn test_reserved_markup_is_taken_off_the_budget() {
        let mut sel = selection(
            vec![
                candidate("a", Priority::Optional, &numbered_words("alpha", 30)),
                candidate("b", Priority::Optional, &numbered_words("beta", 30)),
            ],
            60,
        );
        assert!(!sel.exceeds_budget());

        sel.layout_tokens = 10;
        assert!(sel.exceeds_budget());
        let segments = compressor().compress(&sel, 60).unwrap();
        let total: usize = segments.iter().map(|s| s.compressed_tokens).sum();
        assert!(total <= 50);
        assert_eq!(segments[0].method, CompressionMethod::Semantic);
        assert_eq!(segments[1].method, CompressionMethod::None);
    }

    #[test]
    fn test_critical_only_gets_template() {
        let text = format!("Please note that {}", numbered_words("persona", 497));
        let sel = selection(vec![candidate("critical", Priority::Critical, &text)], 400);
        assert_eq!(sel.total_tokens, 500);

        let segments = compressor().compress(&sel, 400).unwrap();
        assert_eq!(segments[0].method, CompressionMethod::Template);
        assert_eq!(segments[0].compressed_tokens, 497);
        assert!(segments[0].text.starts_with("persona0"));
    }

    #[test]
    fn test_recompression_is_idempotent() {
        let text = format!("Please note that {}", numbered_words("persona", 497));
        let sel = selection(vec![candidate("critical", Priority::Critical, &text)], 400);
        let c = compressor();
        let once = c.compress(&sel, 400).unwrap();
        let twice = c.compress_segments(once.clone(), 400).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_optional_content_goes_semantic() {
        let sel = selection(
            vec![
                candidate("critical", Priority::Critical, &numbered_words("core", 100)),
                candidate("extra", Priority::Optional, &numbered_words("note", 200)),
            ],
            150,
        );
        let segments = compressor().compress(&sel, 150).unwrap();
        assert_eq!(segments[0].method, CompressionMethod::None);
        assert_eq!(segments[1].method, CompressionMethod::Semantic);
        assert!(segments[1].text.starts_with("Key concepts:"));
        let total: usize = segments.iter().map(|s| s.compressed_tokens).sum();
        assert!(total <= 150);
    }

    #[test]
    fn test_never_reorders_or_grows() {
        let sel = selection(
            vec![
                candidate("a", Priority::High, "First point here. Second point there. Third point elsewhere. Fourth point."),
                candidate("b", Priority::Low, "Alpha beta gamma. Delta epsilon zeta. Eta theta iota. Kappa lambda mu."),
                candidate("c", Priority::Medium, "One two three. Four five six. Seven eight nine. Ten eleven twelve."),
            ],
            20,
        );
        let segments = compressor().compress(&sel, 20).unwrap();
        let ids: Vec<&str> = segments.iter().map(|s| s.source_candidate_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        for segment in &segments {
            assert!(segment.compressed_tokens <= segment.original_tokens);
        }
        let total: usize = segments.iter().map(|s| s.compressed_tokens).sum();
        assert!(total <= 20);
    }

    #[test]
    fn test_failed_extractive_falls_through_to_truncation() {
        let sel = selection(
            vec![candidate("low", Priority::Low, &numbered_words("word", 50))],
            10,
        );
        let segments = compressor().compress(&sel, 10).unwrap();
        assert_eq!(segments[0].method, CompressionMethod::Truncation);
        assert_eq!(segments[0].compressed_tokens, 10);
        assert!(segments[0].text.starts_with("word0 word1"));
    }

    #[test]
    fn test_template_cleanup() {
        let c = compressor();
        let cleaned = c
            .template("-----\nAs mentioned earlier, the **build**   passed\nthe build passed\n=====")
            .unwrap();
        assert_eq!(cleaned, "the build passed");
        assert!(c.template("please note that").is_err());
    }

    #[test]
    fn test_extractive_keeps_original_order() {
        let c = compressor();
        let summary = c
            .extractive("Cache eviction matters. Weather is nice. Cache eviction policy is LRU. Lunch was good.", 0.5)
            .unwrap();
        assert_eq!(summary, "Cache eviction matters. Cache eviction policy is LRU.");
        assert!(c.extractive("Only one sentence", 0.5).is_err());
    }

    #[test]
    fn test_truncate_prefers_sentence_boundary() {
        let c = compressor();
        assert_eq!(c.truncate("One two three. Four five six. Seven", 4), "One two three.");
        assert_eq!(c.truncate("alpha beta gamma delta", 2), "alpha beta");
        assert_eq!(c.truncate("anything", 0), "");
    }
}
