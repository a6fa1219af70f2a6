//! Session context budget: the per-category ledger, compaction, and the
//! tracker tying them together.
//!
//! 1. **[`ledger`]**: [`CategoryLedger`] keeps every recorded item per
//!    [`UsageCategory`] so totals can be broken down and compacted item by
//!    item.
//!
//! 2. **[`compaction`]**: three levels (soft, strategic, emergency) of
//!    oldest-first reduction. [`compaction::plan`] previews, and
//!    [`compaction::execute`] applies. System prompt, objectives, in-progress
//!    edits and error context are never reduced.
//!
//! 3. **[`tracker`]**: [`ContextTracker`] records usage, classifies it
//!    against the safety-margined limit, and runs compactions and session
//!    resets with persistence after each change.

pub mod compaction;
pub mod ledger;
pub mod tracker;

pub use compaction::{
    CompactionLevel, CompactionPlan, CompactionPolicy, CompactionResult, ReductionRule,
};
pub use ledger::{CategoryLedger, LedgerItem, UsageBreakdown, UsageCategory};
pub use tracker::{CompactionOpportunities, ContextConfig, ContextTracker, LevelSavings};
