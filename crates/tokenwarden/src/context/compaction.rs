//! Three-level compaction of the context ledger.
//!
//! Compaction reclaims context budget by dropping the oldest, lowest-value
//! items from a [`CategoryLedger`]. Each level applies a per-category
//! [`ReductionRule`]; the default [`CompactionPolicy`] is:
//!
//! | Level | File reads | Tool results (per tool) | Conversation | Verbose output |
//! |---|---|---|---|---|
//! | soft | keep last 10 | keep last 5 | unchanged | unchanged |
//! | strategic | keep last 5 | keep last 5 | retain 50% | retain 30% |
//! | emergency | keep last 3 | keep last 2 | retain 25% | retain 30% |
//!
//! Every level removes at least as much as the one below it. System prompt,
//! objectives, in-progress edits, error context, generated code and any
//! category the policy does not name are never touched.
//!
//! [`plan`] is a pure projection and can be called as often as a preview UI
//! likes. [`execute`] (or [`execute_plan`] for a plan the user already
//! confirmed) mutates the ledger and reports what was actually removed.

use super::ledger::{CategoryLedger, LedgerItem, UsageCategory};
use crate::error::TrackerWarning;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::debug;

/// How aggressively to compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionLevel {
    Soft,
    Strategic,
    Emergency,
}

impl CompactionLevel {
    pub const ALL: [CompactionLevel; 3] = [
        CompactionLevel::Soft,
        CompactionLevel::Strategic,
        CompactionLevel::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CompactionLevel::Soft => "soft",
            CompactionLevel::Strategic => "strategic",
            CompactionLevel::Emergency => "emergency",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for CompactionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CompactionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "soft" => Ok(CompactionLevel::Soft),
            "strategic" => Ok(CompactionLevel::Strategic),
            "emergency" => Ok(CompactionLevel::Emergency),
            other => Err(format!(
                "unknown compaction level '{other}' (expected soft, strategic or emergency)"
            )),
        }
    }
}

/// What a compaction level does to one category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ReductionRule {
    /// Never reduced.
    Preserve,
    /// Keep the `count` most recent items. With `per_label`, the count
    /// applies separately to each label (e.g. each tool name).
    KeepRecent { count: usize, per_label: bool },
    /// Keep `floor(total * fraction)` tokens, trimming the oldest first.
    RetainFraction { fraction: f64 },
}

impl ReductionRule {
    pub fn keep_recent(count: usize) -> Self {
        ReductionRule::KeepRecent {
            count,
            per_label: false,
        }
    }

    pub fn keep_recent_per_label(count: usize) -> Self {
        ReductionRule::KeepRecent {
            count,
            per_label: true,
        }
    }

    pub fn retain_fraction(fraction: f64) -> Self {
        ReductionRule::RetainFraction {
            fraction: fraction.clamp(0.0, 1.0),
        }
    }

    /// Indices of the items this rule may drain, oldest first.
    fn candidates(&self, items: &[LedgerItem]) -> Vec<usize> {
        match *self {
            ReductionRule::Preserve => Vec::new(),
            ReductionRule::RetainFraction { .. } => (0..items.len()).collect(),
            ReductionRule::KeepRecent { count, per_label } => {
                let mut kept_per_group: HashMap<Option<&str>, usize> = HashMap::new();
                let mut keep = vec![false; items.len()];
                for (idx, item) in items.iter().enumerate().rev() {
                    let group = if per_label { item.label.as_deref() } else { None };
                    let kept = kept_per_group.entry(group).or_insert(0);
                    if *kept < count {
                        *kept += 1;
                        keep[idx] = true;
                    }
                }
                (0..items.len()).filter(|&idx| !keep[idx]).collect()
            }
        }
    }

    /// Tokens this rule would remove from `items`.
    fn removable(&self, items: &[LedgerItem]) -> u64 {
        match *self {
            ReductionRule::Preserve => 0,
            ReductionRule::RetainFraction { fraction } => {
                let total = items.iter().map(|i| i.amount).fold(0, u64::saturating_add);
                let retained = (total as f64 * fraction.clamp(0.0, 1.0)).floor() as u64;
                total.saturating_sub(retained)
            }
            ReductionRule::KeepRecent { .. } => self
                .candidates(items)
                .into_iter()
                .map(|idx| items[idx].amount)
                .fold(0, u64::saturating_add),
        }
    }
}

/// Per-level reduction rules.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionPolicy {
    levels: [BTreeMap<UsageCategory, ReductionRule>; 3],
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        use ReductionRule as R;
        use UsageCategory as C;

        let soft = BTreeMap::from([
            (C::FileRead, R::keep_recent(10)),
            (C::ToolResult, R::keep_recent_per_label(5)),
        ]);
        let strategic = BTreeMap::from([
            (C::FileRead, R::keep_recent(5)),
            (C::ToolResult, R::keep_recent_per_label(5)),
            (C::Conversation, R::retain_fraction(0.5)),
            (C::VerboseOutput, R::retain_fraction(0.3)),
        ]);
        let emergency = BTreeMap::from([
            (C::FileRead, R::keep_recent(3)),
            (C::ToolResult, R::keep_recent_per_label(2)),
            (C::Conversation, R::retain_fraction(0.25)),
            (C::VerboseOutput, R::retain_fraction(0.3)),
        ]);
        Self {
            levels: [soft, strategic, emergency],
        }
    }
}

impl CompactionPolicy {
    /// Override the rule for one category at one level.
    ///
    /// Rules set on preserved categories are ignored by [`rule`](Self::rule).
    pub fn with_rule(
        mut self,
        level: CompactionLevel,
        category: UsageCategory,
        rule: ReductionRule,
    ) -> Self {
        self.levels[level.index()].insert(category, rule);
        self
    }

    /// Effective rule for `category` at `level`.
    pub fn rule(&self, level: CompactionLevel, category: &UsageCategory) -> ReductionRule {
        if category.is_preserved() {
            return ReductionRule::Preserve;
        }
        self.levels[level.index()]
            .get(category)
            .copied()
            .unwrap_or(ReductionRule::Preserve)
    }
}

/// Projection for one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryPlan {
    pub rule: ReductionRule,
    pub current: u64,
    pub removable: u64,
}

impl CategoryPlan {
    pub fn retained(&self) -> u64 {
        self.current.saturating_sub(self.removable)
    }
}

/// Result of [`plan`]: what a level would do, without doing it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionPlan {
    pub level: CompactionLevel,
    pub per_category: BTreeMap<UsageCategory, CategoryPlan>,
    pub estimated_savings: u64,
}

/// Result of executing a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    pub level: CompactionLevel,
    pub before: u64,
    pub after: u64,
    pub estimated_savings: u64,
    pub actual_savings: u64,
    pub removed: BTreeMap<UsageCategory, u64>,
    pub warnings: Vec<TrackerWarning>,
}

/// Project `level` onto the ledger. Never mutates it.
pub fn plan(
    ledger: &CategoryLedger,
    level: CompactionLevel,
    policy: &CompactionPolicy,
) -> CompactionPlan {
    let per_category: BTreeMap<UsageCategory, CategoryPlan> = ledger
        .categories()
        .map(|category| {
            let rule = policy.rule(level, category);
            let items = ledger.items(category);
            let plan = CategoryPlan {
                rule,
                current: ledger.category_total(category),
                removable: rule.removable(items),
            };
            (category.clone(), plan)
        })
        .collect();
    let estimated_savings = per_category
        .values()
        .map(|p| p.removable)
        .fold(0, u64::saturating_add);

    CompactionPlan {
        level,
        per_category,
        estimated_savings,
    }
}

/// Plan and execute `level` in one step.
pub fn execute(
    ledger: &mut CategoryLedger,
    level: CompactionLevel,
    policy: &CompactionPolicy,
) -> CompactionResult {
    let plan = plan(ledger, level, policy);
    execute_plan(ledger, &plan)
}

/// Apply a previously computed plan.
///
/// Each category loses at most what the plan estimated, drained oldest first
/// from the items its rule does not protect. If the ledger shrank since the
/// plan was made, the removal is capped to what is left and a
/// [`TrackerWarning::CompactionOverreach`] is reported.
pub fn execute_plan(ledger: &mut CategoryLedger, plan: &CompactionPlan) -> CompactionResult {
    let before = ledger.total();
    let mut removed = BTreeMap::new();
    let mut warnings = Vec::new();

    for (category, category_plan) in &plan.per_category {
        if category_plan.removable == 0 || category.is_preserved() {
            continue;
        }
        let candidates = category_plan.rule.candidates(ledger.items(category));
        let taken = ledger.reduce(category, &candidates, category_plan.removable);
        debug!(
            "compaction [{}] {category}: removed {taken} of {} planned",
            plan.level, category_plan.removable
        );
        if taken < category_plan.removable {
            let warning = TrackerWarning::CompactionOverreach {
                category: category.clone(),
                requested: category_plan.removable,
                removed: taken,
            };
            warnings.push(warning);
        }
        if taken > 0 {
            removed.insert(category.clone(), taken);
        }
    }

    let after = ledger.total();
    CompactionResult {
        level: plan.level,
        before,
        after,
        estimated_savings: plan.estimated_savings,
        actual_savings: before - after,
        removed,
        warnings,
    }
}
