//! Severity classification shared by the quota and context trackers.
//!
//! A [`ThresholdTable`] is an ascending list of percent boundaries, each with
//! a label and a recommendation template. [`classify`] picks the highest tier
//! whose boundary does not exceed the current usage percentage. The table is
//! supplied per domain at construction time, so the quota window can use
//! seven tiers while the context window uses six.

use crate::error::BudgetError;
use serde::{Deserialize, Serialize};

/// Position of a tier in its table. Higher is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tier(pub usize);

impl Tier {
    /// The lowest tier of every table.
    pub const BASELINE: Tier = Tier(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// One row of a threshold table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierSpec {
    /// Lower bound (inclusive) of this tier, in percent of the limit.
    pub threshold_percent: f64,
    pub label: String,
    /// Rendered by [`render_recommendation`]. Supports `{percent}`, `{used}`,
    /// `{limit}` and `{remaining}` placeholders.
    pub recommendation: String,
}

impl TierSpec {
    pub fn new(
        threshold_percent: f64,
        label: impl Into<String>,
        recommendation: impl Into<String>,
    ) -> Self {
        Self {
            threshold_percent,
            label: label.into(),
            recommendation: recommendation.into(),
        }
    }
}

/// Ordered, validated set of tiers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdTable {
    tiers: Vec<TierSpec>,
}

impl ThresholdTable {
    /// Validate and build a table. The first tier must start at 0% and the
    /// boundaries must be strictly ascending.
    pub fn new(tiers: Vec<TierSpec>) -> Result<Self, BudgetError> {
        let Some(first) = tiers.first() else {
            return Err(BudgetError::InvalidThresholdTable {
                reason: "table has no tiers".into(),
            });
        };
        if first.threshold_percent != 0.0 {
            return Err(BudgetError::InvalidThresholdTable {
                reason: format!(
                    "first tier '{}' starts at {}% instead of 0%",
                    first.label, first.threshold_percent
                ),
            });
        }
        for pair in tiers.windows(2) {
            let (lower, upper) = (&pair[0], &pair[1]);
            if !upper.threshold_percent.is_finite()
                || upper.threshold_percent <= lower.threshold_percent
            {
                return Err(BudgetError::InvalidThresholdTable {
                    reason: format!(
                        "tier '{}' ({}%) does not ascend from '{}' ({}%)",
                        upper.label,
                        upper.threshold_percent,
                        lower.label,
                        lower.threshold_percent
                    ),
                });
            }
        }
        Ok(Self { tiers })
    }

    /// Seven-tier table for the rolling quota window:
    /// 0 / 10 / 25 / 50 / 80 / 90 / 95 percent.
    pub fn quota() -> Self {
        Self {
            tiers: vec![
                TierSpec::new(0.0, "fresh", "Quota window is fresh: {remaining} tokens available."),
                TierSpec::new(10.0, "light", "Light usage ({percent}%). Proceed normally."),
                TierSpec::new(
                    25.0,
                    "moderate",
                    "A quarter of the quota window is used ({percent}%). Prefer focused requests.",
                ),
                TierSpec::new(
                    50.0,
                    "elevated",
                    "Half of the quota window is used ({percent}%). Batch related work and skip exploratory reads.",
                ),
                TierSpec::new(
                    80.0,
                    "strategic",
                    "Quota at {percent}%. Plan the remaining {remaining} tokens strategically and defer non-essential tasks.",
                ),
                TierSpec::new(
                    90.0,
                    "danger",
                    "Quota at {percent}%. Finish the current task and hold new work until usage ages out.",
                ),
                TierSpec::new(
                    95.0,
                    "critical",
                    "Quota critical ({percent}%, {used}/{limit}). Stop starting new work until the window resets.",
                ),
            ],
        }
    }

    /// Six-tier table for the session context budget:
    /// 0 / 10 / 25 / 50 / 80 / 90 percent. The 80-90% band is a single
    /// "danger" tier here.
    pub fn context() -> Self {
        Self {
            tiers: vec![
                TierSpec::new(0.0, "fresh", "Context is fresh: {remaining} tokens available."),
                TierSpec::new(10.0, "light", "Light context usage ({percent}%)."),
                TierSpec::new(
                    25.0,
                    "moderate",
                    "Context at {percent}%. Avoid re-reading files already in context.",
                ),
                TierSpec::new(
                    50.0,
                    "elevated",
                    "Context at {percent}%. Consider a soft compaction of old file reads and tool output.",
                ),
                TierSpec::new(
                    80.0,
                    "danger",
                    "Context at {percent}%. Run a strategic compaction before continuing.",
                ),
                TierSpec::new(
                    90.0,
                    "critical",
                    "Context critical ({percent}%, {used}/{limit}). Run an emergency compaction or start a new session.",
                ),
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn tiers(&self) -> &[TierSpec] {
        &self.tiers
    }

    /// Definition of a tier, clamped to the most severe tier when out of range.
    pub fn tier_spec(&self, tier: Tier) -> &TierSpec {
        let idx = tier.0.min(self.tiers.len() - 1);
        &self.tiers[idx]
    }

    pub fn most_severe(&self) -> Tier {
        Tier(self.tiers.len() - 1)
    }

    /// Look a tier up by label (used when restoring persisted state).
    pub fn find_label(&self, label: &str) -> Option<Tier> {
        self.tiers.iter().position(|t| t.label == label).map(Tier)
    }

    /// Highest tier whose boundary does not exceed `percent`.
    pub fn tier_for_percent(&self, percent: f64) -> Tier {
        if percent.is_nan() {
            return self.most_severe();
        }
        let idx = self
            .tiers
            .iter()
            .rposition(|t| t.threshold_percent <= percent)
            .unwrap_or(0);
        Tier(idx)
    }

    /// Lower bound of a tier in percent.
    pub fn threshold_of(&self, tier: Tier) -> f64 {
        self.tier_spec(tier).threshold_percent
    }
}

/// Classified usage snapshot handed to the presentation layer.
///
/// `percent` is never clamped: over-limit states report the most severe tier
/// with `percent > 100`. Use [`display_percent`](Self::display_percent) for
/// progress bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub used: u64,
    pub limit: u64,
    pub percent: f64,
    pub level: Tier,
    pub label: String,
    pub recommendation: String,
}

impl BudgetStatus {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_over_limit(&self) -> bool {
        self.used > self.limit
    }

    /// Percent clamped to `0..=100`.
    pub fn display_percent(&self) -> f64 {
        self.percent.clamp(0.0, 100.0)
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "{} ({:.0}% of {}, {} used)",
            self.label,
            self.percent,
            self.limit,
            self.used
        )
    }
}

/// Classify `used` against `limit`.
///
/// A zero limit classifies straight to the most severe tier.
pub fn classify(used: u64, limit: u64, table: &ThresholdTable) -> BudgetStatus {
    let (percent, level) = if limit == 0 {
        (100.0, table.most_severe())
    } else {
        let percent = used as f64 * 100.0 / limit as f64;
        (percent, table.tier_for_percent(percent))
    };
    let tier = table.tier_spec(level);
    BudgetStatus {
        used,
        limit,
        percent,
        level,
        label: tier.label.clone(),
        recommendation: render_recommendation(&tier.recommendation, used, limit, percent),
    }
}

/// Fill in the placeholders of a recommendation template.
pub fn render_recommendation(template: &str, used: u64, limit: u64, percent: f64) -> String {
    template
        .replace("{percent}", &format!("{percent:.0}"))
        .replace("{used}", &used.to_string())
        .replace("{limit}", &limit.to_string())
        .replace("{remaining}", &limit.saturating_sub(used).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_tables_are_valid() {
        let quota = ThresholdTable::quota();
        assert_eq!(quota.len(), 7);
        assert!(ThresholdTable::new(quota.tiers().to_vec()).is_ok());

        let context = ThresholdTable::context();
        assert_eq!(context.len(), 6);
        assert!(ThresholdTable::new(context.tiers().to_vec()).is_ok());
    }

    #[test]
    fn quota_and_context_differ_at_eighty_percent() {
        let quota = classify(85, 100, &ThresholdTable::quota());
        let context = classify(85, 100, &ThresholdTable::context());
        assert_eq!(quota.label, "strategic");
        assert_eq!(context.label, "danger");
    }

    #[test]
    fn picks_highest_threshold_not_exceeding_percent() {
        let table = ThresholdTable::quota();
        assert_eq!(classify(0, 1000, &table).label, "fresh");
        assert_eq!(classify(99, 1000, &table).label, "fresh");
        assert_eq!(classify(100, 1000, &table).label, "light");
        assert_eq!(classify(500, 1000, &table).label, "elevated");
        assert_eq!(classify(899, 1000, &table).label, "strategic");
        assert_eq!(classify(900, 1000, &table).label, "danger");
        assert_eq!(classify(950, 1000, &table).label, "critical");
    }

    #[test]
    fn over_limit_is_critical_and_unclamped() {
        let status = classify(250, 200, &ThresholdTable::quota());
        assert_eq!(status.label, "critical");
        assert_eq!(status.level, ThresholdTable::quota().most_severe());
        assert!(status.percent > 100.0);
        assert!(status.is_over_limit());
        assert_eq!(status.display_percent(), 100.0);
        assert_eq!(status.remaining(), 0);
    }

    #[test]
    fn zero_limit_is_most_severe() {
        let table = ThresholdTable::context();
        let status = classify(0, 0, &table);
        assert_eq!(status.level, table.most_severe());
        assert_eq!(status.label, "critical");
    }

    #[test]
    fn classification_is_deterministic() {
        let table = ThresholdTable::quota();
        for used in [0, 17, 250, 801, 2000] {
            assert_eq!(classify(used, 1000, &table), classify(used, 1000, &table));
        }
    }

    #[test]
    fn recommendation_placeholders_are_rendered() {
        let status = classify(160_000, 200_000, &ThresholdTable::quota());
        assert_eq!(status.label, "strategic");
        assert!(status.recommendation.contains("80%"));
        assert!(status.recommendation.contains("40000"));
        assert!(!status.recommendation.contains('{'));
    }

    #[test]
    fn rejects_empty_table() {
        assert!(matches!(
            ThresholdTable::new(vec![]),
            Err(BudgetError::InvalidThresholdTable { .. })
        ));
    }

    #[test]
    fn rejects_non_zero_start_and_descending() {
        assert!(ThresholdTable::new(vec![TierSpec::new(5.0, "a", "")]).is_err());
        assert!(
            ThresholdTable::new(vec![
                TierSpec::new(0.0, "a", ""),
                TierSpec::new(50.0, "b", ""),
                TierSpec::new(50.0, "c", ""),
            ])
            .is_err()
        );
    }

    #[test]
    fn find_label_round_trips_tiers() {
        let table = ThresholdTable::context();
        assert_eq!(table.find_label("danger"), Some(Tier(4)));
        assert_eq!(table.find_label("strategic"), None);
    }
}
