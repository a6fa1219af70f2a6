//! Per-session token ledger, grouped by usage category.
//!
//! Each category keeps its recorded items in arrival order so compaction can
//! reason about "the most recent K file reads" rather than an opaque total.
//! A category's total is always the sum of its items. Totals only grow
//! through [`CategoryLedger::record`] and only shrink when a compaction is
//! executed against the ledger.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use schemars::r#gen::SchemaGenerator;
use schemars::schema::Schema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// What a chunk of context was spent on.
///
/// Serialized as a kebab-case string; unrecognized names round-trip through
/// [`UsageCategory::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum UsageCategory {
    FileRead,
    ToolResult,
    Conversation,
    VerboseOutput,
    CodeGeneration,
    SystemPrompt,
    /// Current objectives and decisions.
    Objective,
    InProgressEdit,
    /// Error and debugging context.
    ErrorContext,
    Custom(String),
}

impl UsageCategory {
    pub fn as_str(&self) -> &str {
        match self {
            UsageCategory::FileRead => "file-read",
            UsageCategory::ToolResult => "tool-result",
            UsageCategory::Conversation => "conversation",
            UsageCategory::VerboseOutput => "verbose-output",
            UsageCategory::CodeGeneration => "code-generation",
            UsageCategory::SystemPrompt => "system-prompt",
            UsageCategory::Objective => "objective",
            UsageCategory::InProgressEdit => "in-progress-edit",
            UsageCategory::ErrorContext => "error-context",
            UsageCategory::Custom(name) => name,
        }
    }

    /// Categories that must survive every compaction level untouched.
    pub fn is_preserved(&self) -> bool {
        matches!(
            self,
            UsageCategory::SystemPrompt
                | UsageCategory::Objective
                | UsageCategory::InProgressEdit
                | UsageCategory::ErrorContext
        )
    }
}

impl FromStr for UsageCategory {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "file-read" => UsageCategory::FileRead,
            "tool-result" => UsageCategory::ToolResult,
            "conversation" => UsageCategory::Conversation,
            "verbose-output" => UsageCategory::VerboseOutput,
            "code-generation" => UsageCategory::CodeGeneration,
            "system-prompt" => UsageCategory::SystemPrompt,
            "objective" => UsageCategory::Objective,
            "in-progress-edit" => UsageCategory::InProgressEdit,
            "error-context" => UsageCategory::ErrorContext,
            other => UsageCategory::Custom(other.to_string()),
        })
    }
}

impl From<String> for UsageCategory {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl From<UsageCategory> for String {
    fn from(category: UsageCategory) -> String {
        category.as_str().to_string()
    }
}

impl std::fmt::Display for UsageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl JsonSchema for UsageCategory {
    fn schema_name() -> String {
        "UsageCategory".to_string()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }
}

/// One recorded usage within a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LedgerItem {
    pub amount: u64,
    /// File path, tool name or other producer-supplied tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CategoryEntry {
    items: Vec<LedgerItem>,
    total: u64,
}

/// Snapshot of ledger totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageBreakdown {
    pub total: u64,
    pub categories: BTreeMap<UsageCategory, u64>,
}

/// Mapping from category to its ordered items and running total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryLedger {
    entries: BTreeMap<UsageCategory, CategoryEntry>,
}

impl CategoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to `category`.
    pub fn record(
        &mut self,
        category: UsageCategory,
        amount: u64,
        label: Option<String>,
        recorded_at: DateTime<Utc>,
    ) {
        let entry = self.entries.entry(category).or_default();
        entry.total = entry.total.saturating_add(amount);
        entry.items.push(LedgerItem {
            amount,
            label,
            recorded_at,
        });
    }

    pub fn total(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.total)
            .fold(0, u64::saturating_add)
    }

    pub fn category_total(&self, category: &UsageCategory) -> u64 {
        self.entries.get(category).map_or(0, |e| e.total)
    }

    /// Items of a category, oldest first.
    pub fn items(&self, category: &UsageCategory) -> &[LedgerItem] {
        self.entries
            .get(category)
            .map(|e| e.items.as_slice())
            .unwrap_or(&[])
    }

    pub fn categories(&self) -> impl Iterator<Item = &UsageCategory> {
        self.entries.keys()
    }

    pub fn breakdown(&self) -> UsageBreakdown {
        UsageBreakdown {
            total: self.total(),
            categories: self
                .entries
                .iter()
                .map(|(category, entry)| (category.clone(), entry.total))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|e| e.total == 0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove up to `budget` tokens from the items at `candidates` (indices
    /// into [`items`](Self::items), in the order they should be drained).
    /// The last drained item may be shrunk rather than dropped. Returns the
    /// number of tokens actually removed, which never exceeds `budget` or
    /// what the candidates hold.
    pub(crate) fn reduce(
        &mut self,
        category: &UsageCategory,
        candidates: &[usize],
        budget: u64,
    ) -> u64 {
        let Some(entry) = self.entries.get_mut(category) else {
            return 0;
        };

        let mut removed = 0u64;
        for &idx in candidates {
            if removed >= budget {
                break;
            }
            let Some(item) = entry.items.get_mut(idx) else {
                continue;
            };
            let take = item.amount.min(budget - removed);
            item.amount -= take;
            removed += take;
        }

        entry.items.retain(|item| item.amount > 0);
        entry.total = entry.total.saturating_sub(removed);
        removed
    }

    /// Rebuild from persisted totals and items.
    ///
    /// Items are trusted only when they add up to the persisted total for
    /// their category; otherwise the category collapses into a single item
    /// holding the persisted total, so totals always survive a restart.
    pub fn from_parts(
        totals: &BTreeMap<UsageCategory, u64>,
        items: impl IntoIterator<Item = (UsageCategory, LedgerItem)>,
        restored_at: DateTime<Utc>,
    ) -> Self {
        let mut grouped: BTreeMap<UsageCategory, Vec<LedgerItem>> = BTreeMap::new();
        for (category, item) in items {
            grouped.entry(category).or_default().push(item);
        }

        let mut entries = BTreeMap::new();
        for (category, &total) in totals {
            let items = grouped.remove(category).unwrap_or_default();
            let sum = items.iter().map(|i| i.amount).fold(0, u64::saturating_add);
            let items = if sum == total {
                items.into_iter().filter(|i| i.amount > 0).collect()
            } else if total > 0 {
                vec![LedgerItem {
                    amount: total,
                    label: None,
                    recorded_at: restored_at,
                }]
            } else {
                Vec::new()
            };
            entries.insert(category.clone(), CategoryEntry { items, total });
        }
        Self { entries }
    }

    /// Flatten into `(category, item)` pairs for persistence.
    pub fn to_items(&self) -> Vec<(UsageCategory, LedgerItem)> {
        self.entries
            .iter()
            .flat_map(|(category, entry)| {
                entry
                    .items
                    .iter()
                    .map(move |item| (category.clone(), item.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    #[test]
    fn total_is_sum_of_categories() {
        let mut ledger = CategoryLedger::new();
        ledger.record(UsageCategory::FileRead, 40_000, Some("a.rs".into()), at());
        ledger.record(UsageCategory::ToolResult, 20_000, Some("grep".into()), at());
        ledger.record(UsageCategory::Conversation, 30_000, None, at());
        ledger.record(UsageCategory::FileRead, 1_000, Some("b.rs".into()), at());

        assert_eq!(ledger.total(), 91_000);
        assert_eq!(ledger.category_total(&UsageCategory::FileRead), 41_000);
        assert_eq!(ledger.items(&UsageCategory::FileRead).len(), 2);

        let breakdown = ledger.breakdown();
        assert_eq!(breakdown.total, 91_000);
        assert_eq!(breakdown.categories.values().sum::<u64>(), breakdown.total);
    }

    #[test]
    fn category_names_round_trip() {
        for name in [
            "file-read",
            "tool-result",
            "conversation",
            "verbose-output",
            "code-generation",
            "system-prompt",
            "objective",
            "in-progress-edit",
            "error-context",
            "screenshots",
        ] {
            let category: UsageCategory = name.parse().unwrap();
            assert_eq!(category.as_str(), name);
        }
        assert_eq!(
            "screenshots".parse::<UsageCategory>().unwrap(),
            UsageCategory::Custom("screenshots".into())
        );
    }

    #[test]
    fn categories_serialize_as_map_keys() {
        let mut ledger = CategoryLedger::new();
        ledger.record(UsageCategory::SystemPrompt, 3_000, None, at());
        let json = serde_json::to_value(ledger.breakdown()).unwrap();
        assert_eq!(json["categories"]["system-prompt"], 3_000);
    }

    #[test]
    fn preserved_categories() {
        assert!(UsageCategory::SystemPrompt.is_preserved());
        assert!(UsageCategory::ErrorContext.is_preserved());
        assert!(!UsageCategory::FileRead.is_preserved());
        assert!(!UsageCategory::Custom("x".into()).is_preserved());
    }

    #[test]
    fn reduce_drains_candidates_in_order_and_caps_at_budget() {
        let mut ledger = CategoryLedger::new();
        for amount in [100, 200, 300] {
            ledger.record(UsageCategory::Conversation, amount, None, at());
        }
        let removed = ledger.reduce(&UsageCategory::Conversation, &[0, 1, 2], 250);
        assert_eq!(removed, 250);
        assert_eq!(ledger.category_total(&UsageCategory::Conversation), 350);
        let amounts: Vec<u64> = ledger
            .items(&UsageCategory::Conversation)
            .iter()
            .map(|i| i.amount)
            .collect();
        assert_eq!(amounts, vec![50, 300]);
    }

    #[test]
    fn reduce_never_goes_negative() {
        let mut ledger = CategoryLedger::new();
        ledger.record(UsageCategory::FileRead, 10, None, at());
        let removed = ledger.reduce(&UsageCategory::FileRead, &[0, 5], 1_000);
        assert_eq!(removed, 10);
        assert_eq!(ledger.category_total(&UsageCategory::FileRead), 0);
        assert_eq!(ledger.reduce(&UsageCategory::ToolResult, &[0], 10), 0);
    }

    #[test]
    fn from_parts_trusts_consistent_items() {
        let mut ledger = CategoryLedger::new();
        ledger.record(UsageCategory::FileRead, 10, Some("a".into()), at());
        ledger.record(UsageCategory::FileRead, 20, Some("b".into()), at());
        let totals = ledger.breakdown().categories;
        let restored = CategoryLedger::from_parts(&totals, ledger.to_items(), at());
        assert_eq!(restored, ledger);
    }

    #[test]
    fn from_parts_collapses_inconsistent_items() {
        let mut totals = BTreeMap::new();
        totals.insert(UsageCategory::Conversation, 500);
        let items = vec![(
            UsageCategory::Conversation,
            LedgerItem {
                amount: 10,
                label: None,
                recorded_at: at(),
            },
        )];
        let restored = CategoryLedger::from_parts(&totals, items, at());
        assert_eq!(restored.category_total(&UsageCategory::Conversation), 500);
        assert_eq!(restored.items(&UsageCategory::Conversation).len(), 1);
    }

    #[test]
    fn totals_saturate_at_u64_max() {
        let mut ledger = CategoryLedger::new();
        ledger.record(UsageCategory::FileRead, u64::MAX, None, at());
        ledger.record(UsageCategory::Conversation, 1, None, at());
        assert_eq!(ledger.total(), u64::MAX);
        assert_eq!(ledger.breakdown().total, u64::MAX);

        ledger.record(UsageCategory::FileRead, 5, None, at());
        let totals = ledger.breakdown().categories;
        let restored = CategoryLedger::from_parts(&totals, ledger.to_items(), at());
        assert_eq!(restored.category_total(&UsageCategory::FileRead), u64::MAX);
        assert_eq!(restored.total(), u64::MAX);
    }
}
