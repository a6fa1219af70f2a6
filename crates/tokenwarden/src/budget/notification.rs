//! Edge-triggered threshold notifications with hysteresis.
//!
//! A notification fires when usage climbs into a tier strictly above the
//! highest tier already announced for the scope. When usage falls back (quota
//! events aging out, a compaction), the high-water mark is lowered to the
//! current tier so a later climb re-alerts. Staying inside a tier, or
//! wobbling below an already-announced one, never alerts twice.
//!
//! [`would_notify`] is the pure decision; [`NotificationState`] is the
//! stateful wrapper the trackers persist.

use super::classifier::{BudgetStatus, ThresholdTable, Tier};
use serde::{Deserialize, Serialize};

/// How loudly a notification should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    High,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urgency::Normal => write!(f, "normal"),
            Urgency::High => write!(f, "high"),
        }
    }
}

/// A threshold crossing, emitted at most once per upward crossing per scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub scope: String,
    pub level: Tier,
    pub label: String,
    pub message: String,
    pub urgency: Urgency,
}

/// Urgency of a tier: high for the two most severe tiers of the table.
pub fn urgency_for(tier: Tier, table: &ThresholdTable) -> Urgency {
    if tier.index() + 2 >= table.len() {
        Urgency::High
    } else {
        Urgency::Normal
    }
}

/// Decide whether moving from `previous` (the highest tier already announced,
/// `None` if nothing was) to `new` should alert.
///
/// Only strictly upward moves above the baseline tier alert.
pub fn would_notify(previous: Option<Tier>, new: Tier, table: &ThresholdTable) -> Option<Urgency> {
    let high_water = previous.unwrap_or(Tier::BASELINE);
    (new > high_water).then(|| urgency_for(new, table))
}

/// Per-scope high-water mark of announced tiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationState {
    highest_fired: Option<Tier>,
}

impl NotificationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest_fired(&self) -> Option<Tier> {
        self.highest_fired
    }

    /// Forget everything announced (new session, or the quota window emptied).
    pub fn reset(&mut self) {
        self.highest_fired = None;
    }

    /// Feed a fresh status through the policy, returning a notification if it
    /// crosses a new tier.
    pub fn observe(
        &mut self,
        scope: &str,
        status: &BudgetStatus,
        table: &ThresholdTable,
    ) -> Option<Notification> {
        if let Some(highest) = self.highest_fired
            && status.level < highest
        {
            self.highest_fired = (status.level > Tier::BASELINE).then_some(status.level);
        }

        let urgency = would_notify(self.highest_fired, status.level, table)?;
        self.highest_fired = Some(status.level);
        Some(Notification {
            scope: scope.to_string(),
            level: status.level,
            label: status.label.clone(),
            message: format!(
                "{scope}: crossed into '{}' at {:.0}% ({} of {} tokens). {}",
                status.label, status.percent, status.used, status.limit, status.recommendation
            ),
            urgency,
        })
    }

    /// Label of the highest announced tier, for persistence.
    pub fn highest_label(&self, table: &ThresholdTable) -> Option<String> {
        self.highest_fired.map(|tier| table.tier_spec(tier).label.clone())
    }

    /// Restore from a persisted label. Unknown labels restore as nothing
    /// announced.
    pub fn from_label(label: Option<&str>, table: &ThresholdTable) -> Self {
        Self {
            highest_fired: label.and_then(|l| table.find_label(l)),
        }
    }
}
