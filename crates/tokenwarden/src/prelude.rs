//! Convenience re-exports for common `tokenwarden` types.
//!
//! ```ignore
//! use tokenwarden::prelude::*;
//! ```
//!
//! Covers the trackers and their configs, status and notification types,
//! compaction levels and results, and the event handlers. Persistence
//! internals and the pure compaction functions are left out; import those
//! from their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::amount::TokenAmount;
pub use crate::config::WardenConfig;
pub use crate::error::{BudgetError, TrackerWarning};

// ── Trackers ────────────────────────────────────────────────────────
pub use crate::context::{
    CompactionLevel, CompactionOpportunities, CompactionPlan, CompactionResult, ContextConfig,
    ContextTracker, UsageBreakdown, UsageCategory,
};
pub use crate::quota::{QuotaConfig, QuotaTracker};

// ── Status and alerts ───────────────────────────────────────────────
pub use crate::budget::{BudgetStatus, Notification, ThresholdTable, Tier, Urgency};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{BudgetEvent, EventHandler, FnEventHandler, LoggingHandler, NoopHandler};

// ── Time and storage ────────────────────────────────────────────────
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::persist::StateDir;
