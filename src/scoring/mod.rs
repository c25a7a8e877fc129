//! Scoring aggregator — category, tier, and composite scores.
//!
//! Category scores are pass ratios over the probes actually run; untested
//! categories score 0 and never inflate a composite. Tier scores combine
//! category scores using fixed per-category weights that sum to 100 within
//! each tier; the composite combines tier scores with tier weights that
//! sum to 1.00. Both weight tables are invariants asserted by tests, not
//! silent configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::{Category, ProbeResult, Tier};

// ---------------------------------------------------------------------------
// Weight tables
// ---------------------------------------------------------------------------

/// Weight of a category within its tier, as a percentage. Per tier, these
/// sum to 100.
pub fn category_weight(category: Category) -> u32 {
    match category {
        // Simple tier.
        Category::Suppress => 10,
        Category::SingleTool => 10,
        Category::FormatAdherence => 40,
        Category::OutputDiscipline => 40,
        // Medium tier.
        Category::ToolSelect => 10,
        Category::ParamExtract => 10,
        Category::Clarify => 10,
        Category::ContextRecall => 35,
        Category::InstructionRetention => 35,
        // Complex tier.
        Category::MultiTool => 17,
        Category::Reasoning => 17,
        Category::Refusal => 16,
        Category::ErrorRecovery => 25,
        Category::RoleConsistency => 25,
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Aggregated score for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: Category,
    /// 0–100, `round(100 × passed / total)`; 0 when untested.
    pub score: u8,
    pub passed_count: u32,
    pub total_count: u32,
}

/// Aggregated score for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierScore {
    pub tier: Tier,
    /// 0–100.
    pub score: f64,
}

/// Full aggregation over one battery's probe results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    pub category_scores: Vec<CategoryScore>,
    pub tier_scores: Vec<TierScore>,
    /// 0–100.
    pub composite: f64,
}

/// Aggregate probe results into category, tier, and composite scores.
///
/// Results whose ids carry no category prefix (gate tests) are skipped;
/// they gate execution but do not weight the composite.
pub fn aggregate(results: &[ProbeResult]) -> ScoreReport {
    let mut passed: HashMap<Category, u32> = HashMap::new();
    let mut total: HashMap<Category, u32> = HashMap::new();

    for result in results {
        let Some(category) = result.category() else {
            continue;
        };
        *total.entry(category).or_insert(0) += 1;
        if result.passed {
            *passed.entry(category).or_insert(0) += 1;
        }
    }

    let category_scores: Vec<CategoryScore> = Category::ALL
        .iter()
        .map(|&category| {
            let total_count = total.get(&category).copied().unwrap_or(0);
            let passed_count = passed.get(&category).copied().unwrap_or(0);
            let score = if total_count > 0 {
                ((100.0 * passed_count as f64) / total_count as f64).round() as u8
            } else {
                0
            };
            CategoryScore {
                category,
                score,
                passed_count,
                total_count,
            }
        })
        .collect();

    let tier_scores: Vec<TierScore> = Tier::ALL
        .iter()
        .map(|&tier| {
            let score = category_scores
                .iter()
                .filter(|c| c.category.tier() == tier)
                .map(|c| c.score as f64 * category_weight(c.category) as f64 / 100.0)
                .sum();
            TierScore { tier, score }
        })
        .collect();

    let composite = tier_scores
        .iter()
        .map(|t| t.score * t.tier.weight())
        .sum();

    ScoreReport {
        category_scores,
        tier_scores,
        composite,
    }
}

/// Score for a single category out of a report, 0 when absent.
pub fn category_score(report: &ScoreReport, category: Category) -> u8 {
    report
        .category_scores
        .iter()
        .find(|c| c.category == category)
        .map(|c| c.score)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_weights_sum_to_100_per_tier() {
        for tier in Tier::ALL {
            let total: u32 = Category::ALL
                .iter()
                .filter(|c| c.tier() == tier)
                .map(|&c| category_weight(c))
                .sum();
            assert_eq!(total, 100, "weights for tier {:?} do not sum to 100", tier);
        }
    }

    #[test]
    fn test_tier_weights_sum_to_one() {
        let total: f64 = Tier::ALL.iter().map(|t| t.weight()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_category_score_is_pass_ratio() {
        let results = vec![
            ProbeResult::pass("single_tool.1", "ok"),
            ProbeResult::fail("single_tool.2", "missed"),
            ProbeResult::pass("single_tool.3", "ok"),
        ];
        let report = aggregate(&results);
        assert_eq!(category_score(&report, Category::SingleTool), 67);
    }

    #[test]
    fn test_untested_categories_score_zero() {
        let report = aggregate(&[ProbeResult::pass("reasoning.1", "ok")]);
        assert_eq!(category_score(&report, Category::SingleTool), 0);
        assert_eq!(category_score(&report, Category::Reasoning), 100);
    }

    #[test]
    fn test_gate_results_do_not_weight_composite() {
        let with_gate = aggregate(&[
            ProbeResult::pass("single_tool.1", "ok"),
            ProbeResult::fail("CQG-1", "missed"),
        ]);
        let without_gate = aggregate(&[ProbeResult::pass("single_tool.1", "ok")]);
        assert_eq!(with_gate.composite, without_gate.composite);
    }

    #[test]
    fn test_perfect_battery_scores_100() {
        let results: Vec<ProbeResult> = Category::ALL
            .iter()
            .map(|c| ProbeResult::pass(&format!("{}.1", c.id()), "ok"))
            .collect();
        let report = aggregate(&results);
        assert!((report.composite - 100.0).abs() < 1e-9);
        for tier in &report.tier_scores {
            assert!((tier.score - 100.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_composite_respects_tier_weights() {
        // All simple-tier categories pass, everything else untested (0).
        let results: Vec<ProbeResult> = Category::ALL
            .iter()
            .filter(|c| c.tier() == Tier::Simple)
            .map(|c| ProbeResult::pass(&format!("{}.1", c.id()), "ok"))
            .collect();
        let report = aggregate(&results);
        assert!((report.composite - 20.0).abs() < 1e-9);
    }
}
