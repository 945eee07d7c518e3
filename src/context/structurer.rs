//! Grouping, rendering and quality scoring of the final context window

use super::models::{
    CompressedSegment, CompressionMethod, ContextCandidate, ContextSection, ContextWindow,
    LayoutReserve, OutputFormat, PoolSummary, Priority, QualityScores, SectionGrouping, SourceKind,
};
use super::token_budget::TokenBudget;
use super::token_estimator::TokenEstimator;
use crate::config::{QualityWeights, StructureConfig};
use crate::error::Result;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

/// Turns compressed segments into a rendered [`ContextWindow`]
pub struct ContextStructurer {
    config: StructureConfig,
    weights: QualityWeights,
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextStructurer {
    pub fn new(config: StructureConfig, weights: QualityWeights, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            config,
            weights,
            estimator,
        }
    }

    pub fn default_format(&self) -> OutputFormat {
        self.config.default_format
    }

    /// Assemble the window. Empty segments are skipped.
    pub fn structure(
        &self,
        segments: Vec<CompressedSegment>,
        format: OutputFormat,
        pool: &PoolSummary,
        token_budget: usize,
    ) -> Result<ContextWindow> {
        let budget = TokenBudget::new(token_budget)?;
        let included: Vec<CompressedSegment> = segments.into_iter().filter(|s| !s.is_empty()).collect();

        let total_tokens: usize = included.iter().map(|s| s.compressed_tokens).sum();
        let quality = self.quality(&included, pool, &budget, total_tokens);

        let mut sources_used: Vec<SourceKind> = Vec::new();
        for segment in &included {
            if !sources_used.contains(&segment.source) {
                sources_used.push(segment.source);
            }
        }

        let sections = self.group(included);
        let rendered = match format {
            OutputFormat::Verbose => render_verbose(&sections, self.config.grouping),
            OutputFormat::Minimal => render_minimal(&sections),
        };
        let rendered_tokens = self.estimator.estimate(&rendered);

        Ok(ContextWindow {
            sections,
            total_tokens,
            token_budget,
            budget_utilization: budget.utilization(total_tokens),
            rendered,
            rendered_tokens,
            quality,
            sources_used,
            build_time: Duration::ZERO,
            format,
        })
    }

    /// Markup tokens to set aside before selecting `candidates`
    pub fn layout_reserve(&self, candidates: &[ContextCandidate], format: OutputFormat) -> LayoutReserve {
        self.reserve_for(
            candidates
                .iter()
                .map(|c| (c.id.as_str(), c.source, c.priority, c.token_estimate)),
            format,
        )
    }

    /// Markup tokens a window made of `segments` will spend
    pub fn segment_layout(&self, segments: &[CompressedSegment], format: OutputFormat) -> LayoutReserve {
        self.reserve_for(
            segments
                .iter()
                .map(|s| (s.source_candidate_id.as_str(), s.source, s.priority, s.compressed_tokens)),
            format,
        )
    }

    /// Upper bound on the markup around `items`: one section header per
    /// distinct group label plus the envelope, and one item frame each.
    /// The tokens attribute is sized for the whole pool.
    fn reserve_for<'a>(
        &self,
        items: impl Iterator<Item = (&'a str, SourceKind, Priority, usize)>,
        format: OutputFormat,
    ) -> LayoutReserve {
        let items: Vec<_> = items.collect();
        let width: usize = items.iter().map(|(_, _, _, tokens)| tokens).sum();
        let mut labels: Vec<String> = Vec::new();
        for (_, source, priority, _) in &items {
            let label = self.label_for(*source, *priority);
            if !labels.contains(&label) {
                labels.push(label);
            }
        }

        let (envelope, sections) = match format {
            OutputFormat::Verbose => {
                let attribute = section_attribute(self.config.grouping);
                let sections = labels
                    .iter()
                    .map(|label| {
                        let frame = format!("{}\n{}", section_open(attribute, label, width), SECTION_CLOSE);
                        self.estimator.estimate(&frame)
                    })
                    .sum::<usize>();
                (self.estimator.estimate("<context>\n</context>"), sections)
            }
            OutputFormat::Minimal => {
                let sections = labels
                    .iter()
                    .map(|label| self.estimator.estimate(&format!("### {}\n\n\n", label)))
                    .sum::<usize>();
                (0, sections)
            }
        };

        let per_item: HashMap<String, usize> = items
            .iter()
            .map(|(id, source, priority, _)| {
                let frame = match format {
                    OutputFormat::Verbose => format!(
                        "{}\n{}",
                        item_open(id, *source, *priority, 1.0, CompressionMethod::Extractive),
                        ITEM_CLOSE
                    ),
                    OutputFormat::Minimal => "\n---\n".to_string(),
                };
                (id.to_string(), self.estimator.estimate(&frame))
            })
            .collect();

        LayoutReserve {
            fixed: envelope + sections,
            per_item,
        }
    }

    fn label_for(&self, source: SourceKind, priority: Priority) -> String {
        match self.config.grouping {
            SectionGrouping::BySource => source.to_string(),
            SectionGrouping::ByPriority => priority.to_string(),
            SectionGrouping::Flat => FLAT_LABEL.to_string(),
        }
    }

    fn group(&self, segments: Vec<CompressedSegment>) -> Vec<ContextSection> {
        let mut groups: IndexMap<String, Vec<CompressedSegment>> = IndexMap::new();
        if self.config.grouping == SectionGrouping::ByPriority {
            for tier in Priority::DESCENDING {
                groups.insert(tier.to_string(), Vec::new());
            }
        }
        for segment in segments {
            groups
                .entry(self.label_for(segment.source, segment.priority))
                .or_default()
                .push(segment);
        }
        groups.retain(|_, members| !members.is_empty());

        groups
            .into_iter()
            .map(|(label, segments)| ContextSection {
                tokens: segments.iter().map(|s| s.compressed_tokens).sum(),
                label,
                segments,
            })
            .collect()
    }

    /// Six sub-scores against the retrieved pool, combined tier-first
    ///
    /// `completeness` reads the included count of each tier as one digit of
    /// a mixed-radix number, critical most significant, so covering one more
    /// candidate of a higher tier outranks any coverage below it. `overall`
    /// orders windows by that number and breaks ties with the weighted mean
    /// of the sub-scores.
    pub fn quality(
        &self,
        included: &[CompressedSegment],
        pool: &PoolSummary,
        budget: &TokenBudget,
        total_tokens: usize,
    ) -> QualityScores {
        let retained_relevance: f32 = included.iter().map(|s| s.relevance * s.retention()).sum();
        let relevance = ratio(retained_relevance, pool.total_relevance);

        let original: usize = included.iter().map(|s| s.original_tokens).sum();
        let compressed: usize = included.iter().map(|s| s.compressed_tokens).sum();
        let coherence = if original == 0 {
            1.0
        } else {
            ratio(compressed as f32, original as f32)
        };

        let (rank, span) = tier_rank(included, pool);
        let completeness = if span <= 1.0 {
            0.0
        } else {
            (rank / (span - 1.0)) as f32
        };

        let kinds: BTreeSet<SourceKind> = included.iter().map(|s| s.source).collect();
        let diversity = ratio(kinds.len() as f32, pool.source_kinds.len() as f32);

        let included_temporal: f32 = included.iter().map(|s| s.temporal_relevance).sum();
        let freshness = ratio(included_temporal, pool.total_temporal);

        let token_efficiency = if budget.is_within(total_tokens) {
            1.0
        } else {
            budget.limit() as f32 / total_tokens as f32
        };

        let w = &self.weights;
        let total_weight = w.total();
        let blend = if total_weight <= f32::EPSILON {
            0.0
        } else {
            ((relevance * w.relevance
                + coherence * w.coherence
                + completeness * w.completeness
                + diversity * w.diversity
                + freshness * w.freshness
                + token_efficiency * w.token_efficiency)
                / total_weight)
                .clamp(0.0, 1.0)
        };
        let overall = ((rank + blend as f64) / span) as f32;

        QualityScores {
            relevance,
            coherence,
            completeness: completeness.clamp(0.0, 1.0),
            diversity,
            freshness,
            token_efficiency,
            overall: overall.clamp(0.0, 1.0),
        }
    }
}

/// Included count per tier as a mixed-radix number, critical first,
/// together with the number of values it can take
fn tier_rank(included: &[CompressedSegment], pool: &PoolSummary) -> (f64, f64) {
    let mut rank = 0.0f64;
    let mut span = 1.0f64;
    for tier in Priority::DESCENDING {
        let available = pool.tier_count(tier);
        let taken = included.iter().filter(|s| s.priority == tier).count().min(available);
        rank = rank * (available as f64 + 1.0) + taken as f64;
        span *= available as f64 + 1.0;
    }
    (rank, span)
}

fn ratio(numerator: f32, denominator: f32) -> f32 {
    if denominator <= f32::EPSILON {
        0.0
    } else {
        (numerator / denominator).clamp(0.0, 1.0)
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const FLAT_LABEL: &str = "context";
const SECTION_CLOSE: &str = "  </section>";
const ITEM_CLOSE: &str = "    </item>";

fn section_attribute(grouping: SectionGrouping) -> &'static str {
    match grouping {
        SectionGrouping::BySource => "source",
        SectionGrouping::ByPriority => "priority",
        SectionGrouping::Flat => "name",
    }
}

fn section_open(attribute: &str, label: &str, tokens: usize) -> String {
    format!("  <section {}=\"{}\" tokens=\"{}\">", attribute, escape(label), tokens)
}

fn item_open(id: &str, source: SourceKind, priority: Priority, relevance: f32, method: CompressionMethod) -> String {
    format!(
        "    <item id=\"{}\" source=\"{}\" priority=\"{}\" relevance=\"{:.2}\" compression=\"{}\">",
        escape(id),
        source,
        priority,
        relevance,
        method
    )
}

fn render_verbose(sections: &[ContextSection], grouping: SectionGrouping) -> String {
    let attribute = section_attribute(grouping);

    let mut out = String::from("<context>\n");
    for section in sections {
        let _ = writeln!(out, "{}", section_open(attribute, &section.label, section.tokens));
        for segment in &section.segments {
            let _ = writeln!(
                out,
                "{}",
                item_open(
                    &segment.source_candidate_id,
                    segment.source,
                    segment.priority,
                    segment.relevance,
                    segment.method
                )
            );
            for line in segment.text.lines() {
                let _ = writeln!(out, "{}", escape(line));
            }
            let _ = writeln!(out, "{}", ITEM_CLOSE);
        }
        let _ = writeln!(out, "{}", SECTION_CLOSE);
    }
    out.push_str("</context>");
    out
}

fn render_minimal(sections: &[ContextSection]) -> String {
    sections
        .iter()
        .map(|section| {
            let body = section
                .segments
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n---\n");
            format!("### {}\n{}", section.label, body)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::CompressionMethod;
    use crate::context::token_estimator::WordBasedEstimator;
    use chrono::Utc;

    fn structurer(grouping: SectionGrouping) -> ContextStructurer {
        ContextStructurer::new(
            StructureConfig {
                grouping,
                default_format: OutputFormat::Verbose,
            },
            QualityWeights::default(),
            Arc::new(WordBasedEstimator::new(1.0)),
        )
    }

    fn segment(id: &str, source: SourceKind, priority: Priority, text: &str) -> CompressedSegment {
        let tokens = text.split_whitespace().count();
        CompressedSegment {
            source_candidate_id: id.to_string(),
            source,
            priority,
            original_tokens: tokens,
            compressed_tokens: tokens,
            method: CompressionMethod::None,
            text: text.to_string(),
            relevance: 0.5,
            temporal_relevance: 0.5,
            created_at: Utc::now(),
        }
    }

    fn pool_of(segments: &[CompressedSegment]) -> PoolSummary {
        let mut tier_counts = std::collections::BTreeMap::new();
        for s in segments {
            *tier_counts.entry(s.priority).or_insert(0) += 1;
        }
        PoolSummary {
            candidate_count: segments.len(),
            total_relevance: segments.iter().map(|s| s.relevance).sum(),
            total_temporal: segments.iter().map(|s| s.temporal_relevance).sum(),
            source_kinds: segments.iter().map(|s| s.source).collect(),
            tier_counts,
        }
    }

    fn sample() -> Vec<CompressedSegment> {
        vec![
            segment("conversation:turn-0", SourceKind::Conversation, Priority::Critical, "user: hello there"),
            segment("episodic:e1", SourceKind::Episodic, Priority::Medium, "we shipped <v2> & celebrated"),
            segment("conversation:turn-1", SourceKind::Conversation, Priority::High, "assistant: hi"),
        ]
    }

    #[test]
    fn test_groups_by_source_in_first_seen_order() {
        let window = structurer(SectionGrouping::BySource)
            .structure(sample(), OutputFormat::Verbose, &pool_of(&sample()), 100)
            .unwrap();
        let labels: Vec<&str> = window.sections.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["conversation", "episodic"]);
        assert_eq!(window.sections[0].segments.len(), 2);
        assert_eq!(window.sources_used, vec![SourceKind::Conversation, SourceKind::Episodic]);
        assert_eq!(window.total_tokens, 3 + 5 + 2);
    }

    #[test]
    fn test_groups_by_priority_highest_first() {
        let window = structurer(SectionGrouping::ByPriority)
            .structure(sample(), OutputFormat::Minimal, &pool_of(&sample()), 100)
            .unwrap();
        let labels: Vec<&str> = window.sections.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["critical", "high", "medium"]);
    }

    #[test]
    fn test_verbose_rendering_escapes_markup() {
        let window = structurer(SectionGrouping::BySource)
            .structure(sample(), OutputFormat::Verbose, &pool_of(&sample()), 100)
            .unwrap();
        assert!(window.rendered.starts_with("<context>"));
        assert!(window.rendered.contains("<section source=\"episodic\""));
        assert!(window.rendered.contains("id=\"episodic:e1\""));
        assert!(window.rendered.contains("&lt;v2&gt; &amp; celebrated"));
        assert!(window.rendered_tokens > window.total_tokens);
    }

    #[test]
    fn test_minimal_rendering() {
        let window = structurer(SectionGrouping::BySource)
            .structure(sample(), OutputFormat::Minimal, &pool_of(&sample()), 100)
            .unwrap();
        assert_eq!(
            window.rendered,
            "### conversation\nuser: hello there\n---\nassistant: hi\n\n### episodic\nwe shipped <v2> & celebrated"
        );
    }

    #[test]
    fn test_empty_segments_are_skipped() {
        let mut segments = sample();
        segments[1].text = String::new();
        segments[1].compressed_tokens = 0;
        segments[1].method = CompressionMethod::Truncation;
        let pool = pool_of(&sample());
        let window = structurer(SectionGrouping::BySource)
            .structure(segments, OutputFormat::Verbose, &pool, 100)
            .unwrap();
        assert!(!window.contains_candidate("episodic:e1"));
        assert_eq!(window.sections.len(), 1);
        assert!(window.quality.completeness < 1.0);
        assert!(window.quality.diversity < 1.0);
    }

    #[test]
    fn test_full_coverage_scores_one() {
        let window = structurer(SectionGrouping::Flat)
            .structure(sample(), OutputFormat::Verbose, &pool_of(&sample()), 100)
            .unwrap();
        let q = window.quality;
        assert!((q.relevance - 1.0).abs() < 1e-6);
        assert!((q.completeness - 1.0).abs() < 1e-6);
        assert!((q.diversity - 1.0).abs() < 1e-6);
        assert!((q.token_efficiency - 1.0).abs() < 1e-6);
        assert!((q.overall - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_layout_reserve_covers_rendered_markup() {
        for grouping in [SectionGrouping::BySource, SectionGrouping::ByPriority, SectionGrouping::Flat] {
            for format in [OutputFormat::Verbose, OutputFormat::Minimal] {
                let structurer = structurer(grouping);
                let layout = structurer.segment_layout(&sample(), format);
                let window = structurer
                    .structure(sample(), format, &pool_of(&sample()), 100)
                    .unwrap();
                let reserved = layout.total_for(sample().iter().map(|s| s.source_candidate_id.as_str()));
                assert!(
                    window.rendered_tokens <= window.total_tokens + reserved,
                    "{:?} {:?}: rendered {} > {} + {}",
                    grouping,
                    format,
                    window.rendered_tokens,
                    window.total_tokens,
                    reserved
                );
            }
        }
    }

    #[test]
    fn test_verbose_item_frame_is_seven_words() {
        let layout = structurer(SectionGrouping::BySource).segment_layout(&sample(), OutputFormat::Verbose);
        assert_eq!(layout.item("episodic:e1"), 7);
        // envelope plus two source sections of four words each
        assert_eq!(layout.fixed, 2 + 2 * 4);
    }

    #[test]
    fn test_higher_tier_coverage_outranks_lower_tiers() {
        let mut pool_segments = vec![segment("high", SourceKind::Semantic, Priority::High, "one high item")];
        for i in 0..5 {
            pool_segments.push(segment(
                &format!("medium-{}", i),
                SourceKind::Semantic,
                Priority::Medium,
                "a medium item",
            ));
        }
        let pool = pool_of(&pool_segments);
        let structurer = structurer(SectionGrouping::BySource);

        let only_high = structurer
            .structure(pool_segments[..1].to_vec(), OutputFormat::Minimal, &pool, 100)
            .unwrap();
        let all_medium = structurer
            .structure(pool_segments[1..].to_vec(), OutputFormat::Minimal, &pool, 100)
            .unwrap();
        assert!(only_high.quality.completeness > all_medium.quality.completeness);
        assert!(only_high.quality_score() > all_medium.quality_score());
    }

    #[test]
    fn test_over_budget_lowers_efficiency() {
        let window = structurer(SectionGrouping::Flat)
            .structure(sample(), OutputFormat::Verbose, &pool_of(&sample()), 5)
            .unwrap();
        assert_eq!(window.total_tokens, 10);
        assert!((window.budget_utilization - 2.0).abs() < 1e-6);
        assert!((window.quality.token_efficiency - 0.5).abs() < 1e-6);
    }
}
