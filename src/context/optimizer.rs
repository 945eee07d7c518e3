//! Budgeted candidate selection
//!
//! Candidates are taken tier by tier (critical first). Every critical
//! candidate is kept even when that alone overflows the budget; the other
//! tiers are filled greedily in the order the active goal prefers, and a
//! tier stops at the first candidate that no longer fits.

use super::models::{ContextCandidate, LayoutReserve, OptimizationGoal, OptimizedSelection, Priority};
use super::text;
use super::token_budget::TokenBudget;
use crate::config::OptimizerConfig;
use crate::error::Result;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Selects the subset of candidates that best serves the goal under budget
#[derive(Debug, Clone, Default)]
pub struct ContextOptimizer {
    config: OptimizerConfig,
}

impl ContextOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Select candidates for `token_budget` according to `goal`
    pub fn optimize(
        &self,
        candidates: &[ContextCandidate],
        token_budget: usize,
        goal: OptimizationGoal,
        priority_overrides: &HashMap<String, Priority>,
    ) -> Result<OptimizedSelection> {
        self.optimize_with_layout(
            candidates,
            token_budget,
            goal,
            priority_overrides,
            &LayoutReserve::default(),
        )
    }

    /// Select candidates, charging each one its rendered markup as well
    ///
    /// `layout.fixed` is paid up front; every candidate then costs its own
    /// tokens plus `layout.item(id)`.
    pub fn optimize_with_layout(
        &self,
        candidates: &[ContextCandidate],
        token_budget: usize,
        goal: OptimizationGoal,
        priority_overrides: &HashMap<String, Priority>,
        layout: &LayoutReserve,
    ) -> Result<OptimizedSelection> {
        let budget = TokenBudget::new(token_budget)?.with_headroom(self.config.selection_headroom);
        let ceiling = budget.selection_limit();

        let pool = Self::apply_overrides(candidates, priority_overrides);
        let cost = |c: &ContextCandidate| c.token_estimate + layout.item(&c.id);

        let max_tokens = pool.iter().map(|c| c.token_estimate).max().unwrap_or(0);
        let term_sets: HashMap<&str, BTreeSet<String>> = match goal {
            OptimizationGoal::DiversityMax => pool
                .iter()
                .map(|c| (c.id.as_str(), text::term_set(&c.text())))
                .collect(),
            _ => HashMap::new(),
        };

        let mut selected: Vec<&ContextCandidate> = Vec::new();
        let mut used = layout.fixed;

        for tier in Priority::DESCENDING {
            let members: Vec<&ContextCandidate> = pool.iter().filter(|c| c.priority == tier).collect();
            if members.is_empty() {
                continue;
            }

            if tier == Priority::Critical {
                let ordered = match goal {
                    OptimizationGoal::DiversityMax => self.diversity_order(members, &selected, &term_sets),
                    _ => self.score_order(members, goal, max_tokens),
                };
                for candidate in ordered {
                    used += cost(candidate);
                    selected.push(candidate);
                }
                if !budget.is_within(used) {
                    warn!(
                        error = %budget.infeasible(used),
                        "critical candidates alone exceed the token budget"
                    );
                }
                continue;
            }

            match goal {
                OptimizationGoal::DiversityMax => {
                    self.fill_diverse(members, &mut selected, &mut used, ceiling, &term_sets, &cost)
                }
                _ => {
                    for candidate in self.score_order(members, goal, max_tokens) {
                        if !TokenBudget::fits_within(used, cost(candidate), ceiling) {
                            debug!(tier = %tier, id = %candidate.id, "tier stopped at budget");
                            break;
                        }
                        used += cost(candidate);
                        selected.push(candidate);
                    }
                }
            }
        }

        let chosen: BTreeSet<&str> = selected.iter().map(|c| c.id.as_str()).collect();
        let dropped = pool
            .iter()
            .filter(|c| !chosen.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();
        let diversity_score = Self::diversity_score(&selected);
        let content: usize = selected.iter().map(|c| c.token_estimate).sum();
        let candidates: Vec<ContextCandidate> = selected.into_iter().cloned().collect();

        debug!(
            goal = goal.as_str(),
            selected = candidates.len(),
            tokens = content,
            layout = used - content,
            budget = token_budget,
            "optimized selection"
        );

        Ok(OptimizedSelection {
            candidates,
            total_tokens: content,
            token_budget,
            budget_utilization: budget.utilization(content),
            diversity_score,
            goal,
            dropped,
            layout_tokens: used - content,
        })
    }

    /// Candidates with per-id priority overrides applied, pool order kept
    pub fn apply_overrides(
        candidates: &[ContextCandidate],
        priority_overrides: &HashMap<String, Priority>,
    ) -> Vec<ContextCandidate> {
        candidates
            .iter()
            .map(|c| match priority_overrides.get(&c.id) {
                Some(priority) if *priority != c.priority => c.with_priority(*priority),
                _ => c.clone(),
            })
            .collect()
    }

    /// Score a candidate under a score-ordered goal
    pub fn goal_score(&self, candidate: &ContextCandidate, goal: OptimizationGoal, max_tokens: usize) -> f32 {
        let relevance = &candidate.relevance;
        match goal {
            OptimizationGoal::RelevanceMax | OptimizationGoal::DiversityMax => relevance.composite,
            OptimizationGoal::FreshnessMax => relevance.temporal_relevance,
            OptimizationGoal::Balanced => {
                let weights = &self.config.balanced_weights;
                let weighted = (relevance.semantic_similarity * weights.semantic_similarity
                    + relevance.temporal_relevance * weights.temporal_relevance
                    + relevance.frequency_importance * weights.frequency_importance
                    + relevance.contextual_fit * weights.contextual_fit
                    + relevance.user_preference * weights.user_preference)
                    / weights.total();
                let efficiency = if max_tokens == 0 {
                    1.0
                } else {
                    1.0 - candidate.token_estimate as f32 / max_tokens as f32
                };
                weighted
                    + self.config.priority_bonus.for_priority(candidate.priority)
                    + self.config.efficiency_bonus * efficiency
            }
        }
    }

    /// Descending score; balanced ties go to the cheaper candidate, then pool order
    fn score_order<'a>(
        &self,
        mut members: Vec<&'a ContextCandidate>,
        goal: OptimizationGoal,
        max_tokens: usize,
    ) -> Vec<&'a ContextCandidate> {
        members.sort_by(|a, b| {
            let sa = self.goal_score(a, goal, max_tokens);
            let sb = self.goal_score(b, goal, max_tokens);
            let by_score = sb.total_cmp(&sa);
            let by_cost = match goal {
                OptimizationGoal::Balanced => a.token_estimate.cmp(&b.token_estimate),
                _ => Ordering::Equal,
            };
            by_score.then(by_cost).then(a.position.cmp(&b.position))
        });
        members
    }

    /// Greedy farthest-point order over `members`, seeded by what is already chosen
    fn diversity_order<'a>(
        &self,
        mut members: Vec<&'a ContextCandidate>,
        already: &[&'a ContextCandidate],
        term_sets: &HashMap<&str, BTreeSet<String>>,
    ) -> Vec<&'a ContextCandidate> {
        let mut chosen: Vec<&'a ContextCandidate> = already.to_vec();
        let mut ordered = Vec::with_capacity(members.len());
        while let Some(idx) = Self::farthest(&members, &chosen, term_sets) {
            let next = members.remove(idx);
            chosen.push(next);
            ordered.push(next);
        }
        ordered
    }

    fn fill_diverse<'a>(
        &self,
        mut members: Vec<&'a ContextCandidate>,
        selected: &mut Vec<&'a ContextCandidate>,
        used: &mut usize,
        ceiling: usize,
        term_sets: &HashMap<&str, BTreeSet<String>>,
        cost: &dyn Fn(&ContextCandidate) -> usize,
    ) {
        while let Some(idx) = Self::farthest(&members, selected, term_sets) {
            let next = members[idx];
            if !TokenBudget::fits_within(*used, cost(next), ceiling) {
                break;
            }
            members.remove(idx);
            *used += cost(next);
            selected.push(next);
        }
    }

    /// Index of the member least similar to anything chosen so far.
    /// Ties prefer higher composite relevance, then pool order.
    fn farthest(
        members: &[&ContextCandidate],
        chosen: &[&ContextCandidate],
        term_sets: &HashMap<&str, BTreeSet<String>>,
    ) -> Option<usize> {
        let empty = BTreeSet::new();
        let terms = |c: &ContextCandidate| term_sets.get(c.id.as_str()).unwrap_or(&empty);

        members
            .iter()
            .enumerate()
            .map(|(idx, candidate)| {
                let closeness = chosen
                    .iter()
                    .map(|other| text::jaccard(terms(candidate), terms(other)))
                    .fold(0.0f32, f32::max);
                (idx, closeness, candidate)
            })
            .min_by(|(_, ca, a), (_, cb, b)| {
                ca.total_cmp(cb)
                    .then(b.relevance.composite.total_cmp(&a.relevance.composite))
                    .then(a.position.cmp(&b.position))
            })
            .map(|(idx, _, _)| idx)
    }

    /// `1 - mean pairwise similarity`; 1.0 for fewer than two candidates
    fn diversity_score(selected: &[&ContextCandidate]) -> f32 {
        if selected.len() < 2 {
            return 1.0;
        }
        let sets: Vec<BTreeSet<String>> = selected.iter().map(|c| text::term_set(&c.text())).collect();
        let mut total = 0.0f32;
        let mut pairs = 0usize;
        for i in 0..sets.len() {
            for j in (i + 1)..sets.len() {
                total += text::jaccard(&sets[i], &sets[j]);
                pairs += 1;
            }
        }
        1.0 - total / pairs as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::{CandidateContent, RelevanceScore, ScoringWeights, SourceKind};
    use chrono::{TimeZone, Utc};

    fn candidate(id: &str, priority: Priority, tokens: usize, relevance: f32, text: &str, position: usize) -> ContextCandidate {
        ContextCandidate::new(
            id,
            SourceKind::Semantic,
            CandidateContent::Text(text.to_string()),
            tokens,
            priority,
            RelevanceScore::uniform(relevance),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
        .at_position(position)
    }

    /// 1 critical item of 500 tokens plus 10 optional items of 200 tokens
    fn scenario_pool() -> Vec<ContextCandidate> {
        let mut pool = vec![candidate("critical", Priority::Critical, 500, 0.9, "system persona", 0)];
        for i in 0..10 {
            pool.push(candidate(
                &format!("opt-{}", i),
                Priority::Optional,
                200,
                0.1 + i as f32 * 0.05,
                &format!("optional note number {}", i),
                i + 1,
            ));
        }
        pool
    }

    #[test]
    fn test_scenario_budget_1000() {
        let optimizer = ContextOptimizer::default();
        let selection = optimizer
            .optimize(&scenario_pool(), 1000, OptimizationGoal::Balanced, &HashMap::new())
            .unwrap();

        assert_eq!(selection.candidates[0].id, "critical");
        assert_eq!(selection.candidates.len(), 3);
        assert_eq!(selection.total_tokens, 900);
        // Highest balanced scores among the optional items
        assert_eq!(selection.ids(), vec!["critical", "opt-9", "opt-8"]);
        assert!(selection.budget_utilization <= 1.0);
        assert!(!selection.exceeds_budget());
    }

    #[test]
    fn test_layout_reserve_is_charged_per_item() {
        let optimizer = ContextOptimizer::default();
        let pool = scenario_pool();
        let layout = LayoutReserve {
            fixed: 6,
            per_item: pool.iter().map(|c| (c.id.clone(), 7)).collect(),
        };

        let roomy = optimizer
            .optimize_with_layout(&pool, 1000, OptimizationGoal::Balanced, &HashMap::new(), &layout)
            .unwrap();
        assert_eq!(roomy.ids(), vec!["critical", "opt-9", "opt-8"]);
        assert_eq!(roomy.total_tokens, 900);
        assert_eq!(roomy.layout_tokens, 6 + 3 * 7);
        assert!(!roomy.exceeds_budget());

        // 900 tokens of content fit, but not with their markup
        let tight = optimizer
            .optimize_with_layout(&pool, 920, OptimizationGoal::Balanced, &HashMap::new(), &layout)
            .unwrap();
        assert_eq!(tight.ids(), vec!["critical", "opt-9"]);
        assert_eq!(tight.layout_tokens, 6 + 2 * 7);
        assert!(tight.total_tokens + tight.layout_tokens <= 920);
    }

    #[test]
    fn test_scenario_budget_400_keeps_critical() {
        let optimizer = ContextOptimizer::default();
        let selection = optimizer
            .optimize(&scenario_pool(), 400, OptimizationGoal::Balanced, &HashMap::new())
            .unwrap();

        assert_eq!(selection.ids(), vec!["critical"]);
        assert_eq!(selection.total_tokens, 500);
        assert!(selection.budget_utilization > 1.0);
        assert_eq!(selection.dropped.len(), 10);
    }

    #[test]
    fn test_deterministic_ordering() {
        let optimizer = ContextOptimizer::default();
        let mut pool = scenario_pool();
        // Equal scores everywhere except position
        for c in pool.iter_mut().skip(1) {
            c.relevance = RelevanceScore::uniform(0.4);
        }
        for goal in [
            OptimizationGoal::Balanced,
            OptimizationGoal::RelevanceMax,
            OptimizationGoal::DiversityMax,
            OptimizationGoal::FreshnessMax,
        ] {
            let first = optimizer.optimize(&pool, 1500, goal, &HashMap::new()).unwrap();
            for _ in 0..5 {
                let again = optimizer.optimize(&pool, 1500, goal, &HashMap::new()).unwrap();
                assert_eq!(first, again);
            }
        }
        let relevance = optimizer
            .optimize(&pool, 1500, OptimizationGoal::RelevanceMax, &HashMap::new())
            .unwrap();
        assert_eq!(relevance.ids(), vec!["critical", "opt-0", "opt-1", "opt-2", "opt-3", "opt-4"]);
    }

    #[test]
    fn test_tier_order_beats_relevance() {
        let optimizer = ContextOptimizer::default();
        let pool = vec![
            candidate("low", Priority::Low, 100, 0.99, "alpha", 0),
            candidate("high", Priority::High, 100, 0.1, "beta", 1),
        ];
        let selection = optimizer
            .optimize(&pool, 100, OptimizationGoal::RelevanceMax, &HashMap::new())
            .unwrap();
        assert_eq!(selection.ids(), vec!["high"]);
    }

    #[test]
    fn test_tier_stops_at_first_overflow() {
        let optimizer = ContextOptimizer::default();
        let pool = vec![
            candidate("big", Priority::Medium, 800, 0.9, "large", 0),
            candidate("small", Priority::Medium, 50, 0.5, "small", 1),
            candidate("opt", Priority::Optional, 50, 0.5, "extra", 2),
        ];
        let selection = optimizer
            .optimize(&pool, 500, OptimizationGoal::RelevanceMax, &HashMap::new())
            .unwrap();
        // The medium tier stops at "big"; the next tier still gets a chance
        assert_eq!(selection.ids(), vec!["opt"]);
    }

    #[test]
    fn test_balanced_prefers_cheaper_on_equal_relevance() {
        let optimizer = ContextOptimizer::default();
        let pool = vec![
            candidate("expensive", Priority::Medium, 300, 0.5, "one", 0),
            candidate("cheap", Priority::Medium, 100, 0.5, "two", 1),
        ];
        let selection = optimizer
            .optimize(&pool, 1000, OptimizationGoal::Balanced, &HashMap::new())
            .unwrap();
        assert_eq!(selection.ids(), vec!["cheap", "expensive"]);
    }

    #[test]
    fn test_freshness_goal_orders_by_temporal_relevance() {
        let optimizer = ContextOptimizer::default();
        let weights = ScoringWeights::default();
        let mut stale = candidate("stale", Priority::Medium, 100, 0.9, "x", 0);
        stale.relevance = RelevanceScore::new(0.9, 0.1, 0.9, 0.9, 0.9, &weights);
        let mut fresh = candidate("fresh", Priority::Medium, 100, 0.1, "y", 1);
        fresh.relevance = RelevanceScore::new(0.1, 0.95, 0.1, 0.1, 0.1, &weights);

        let selection = optimizer
            .optimize(&[stale, fresh], 150, OptimizationGoal::FreshnessMax, &HashMap::new())
            .unwrap();
        assert_eq!(selection.ids(), vec!["fresh"]);
    }

    #[test]
    fn test_diversity_goal_avoids_near_duplicates() {
        let optimizer = ContextOptimizer::default();
        let pool = vec![
            candidate("a", Priority::Medium, 10, 0.9, "rust async runtime tokio", 0),
            candidate("b", Priority::Medium, 10, 0.85, "rust async runtime tokio executor", 1),
            candidate("c", Priority::Medium, 10, 0.3, "gardening tomatoes soil", 2),
        ];
        let selection = optimizer
            .optimize(&pool, 20, OptimizationGoal::DiversityMax, &HashMap::new())
            .unwrap();
        assert_eq!(selection.ids(), vec!["a", "c"]);
        assert!(selection.diversity_score > 0.9);
    }

    #[test]
    fn test_priority_override_promotes_to_critical() {
        let optimizer = ContextOptimizer::default();
        let pool = vec![candidate("note", Priority::Optional, 700, 0.2, "pinned", 0)];
        let overrides = HashMap::from([("note".to_string(), Priority::Critical)]);
        let selection = optimizer
            .optimize(&pool, 500, OptimizationGoal::Balanced, &overrides)
            .unwrap();
        assert_eq!(selection.ids(), vec!["note"]);
        assert_eq!(selection.candidates[0].priority, Priority::Critical);
        // The input pool is untouched
        assert_eq!(pool[0].priority, Priority::Optional);
    }

    #[test]
    fn test_headroom_allows_overselection() {
        let optimizer = ContextOptimizer::new(OptimizerConfig {
            selection_headroom: 0.5,
            ..OptimizerConfig::default()
        });
        let selection = optimizer
            .optimize(&scenario_pool(), 1000, OptimizationGoal::Balanced, &HashMap::new())
            .unwrap();
        assert_eq!(selection.total_tokens, 1500);
        assert!(selection.exceeds_budget());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let optimizer = ContextOptimizer::default();
        assert!(optimizer
            .optimize(&scenario_pool(), 0, OptimizationGoal::Balanced, &HashMap::new())
            .is_err());
    }
}
