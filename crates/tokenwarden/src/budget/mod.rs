//! Classification and notification logic shared by both trackers.
//!
//! 1. **[`classifier`]** maps `(used, limit, table)` to a [`BudgetStatus`].
//! 2. **[`notification`]** decides when a status change is worth an alert.

pub mod classifier;
pub mod notification;

pub use classifier::{BudgetStatus, ThresholdTable, Tier, TierSpec, classify};
pub use notification::{Notification, NotificationState, Urgency, would_notify};
