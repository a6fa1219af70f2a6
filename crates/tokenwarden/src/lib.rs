//! Token budget tracking for AI coding sessions.
//!
//! `tokenwarden` tracks two independent budgets:
//!
//! - a **rolling quota**: tokens consumed in the trailing N hours, which
//!   frees up continuously as old usage ages out ([`QuotaTracker`]);
//! - a **session context budget**: tokens accumulated since the session
//!   began, broken down by category and reclaimed only by compaction or a new
//!   session ([`ContextTracker`]).
//!
//! Both classify usage into graded tiers with recommendations, announce each
//! upward tier crossing once, and persist their state after every change so
//! it survives restarts. The engine informs and never blocks: recording
//! always succeeds for a valid amount, however far over the limit it goes.
//!
//! # Getting started
//!
//! ```ignore
//! use tokenwarden::prelude::*;
//!
//! fn main() -> Result<(), BudgetError> {
//!     let config = WardenConfig::default();
//!     let mut quota = config.open_quota("default")?.with_handler(LoggingHandler);
//!     let mut context = config.open_context("2026-05-04-a1").with_handler(LoggingHandler);
//!
//!     quota.record_usage(3_200)?;
//!     context.record_item(UsageCategory::FileRead, 3_200, "src/lib.rs")?;
//!
//!     println!("{}", quota.status().to_log_string());
//!     if let Some(level) = context.suggested_compaction() {
//!         let result = context.compact(level)?;
//!         println!("freed {} tokens", result.actual_savings);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Rolling quota:** [`quota::window::UsageWindow`] holds the events and
//!   [`QuotaTracker`] answers used / remaining / time to reset.
//! - **Context budget:** [`context::ledger::CategoryLedger`] and
//!   [`ContextTracker`].
//! - **Compaction:** [`context::compaction`] has the three-level policy,
//!   [`plan`](context::compaction::plan) for previews and
//!   [`execute_plan`](context::compaction::execute_plan) for applying them.
//! - **Tiers and alerts:** [`budget::classifier::classify`] and
//!   [`budget::notification::would_notify`].
//! - **Observing events:** implement [`EventHandler`](events::EventHandler),
//!   or use [`LoggingHandler`](events::LoggingHandler) /
//!   [`FnEventHandler`](events::FnEventHandler).
//! - **Errors and warnings:** [`BudgetError`] fails a call;
//!   [`TrackerWarning`] reports something corrected in place.
//! - **On-disk state:** [`persist`] (atomic writes, tolerant loads, schema
//!   export).
//!
//! # Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`amount`] | Validated [`TokenAmount`] |
//! | [`budget`] | Tier classification and notification hysteresis |
//! | [`clock`] | Time source, with a manual clock for tests |
//! | [`config`] | [`WardenConfig`] defaults and builders |
//! | [`context`] | Category ledger, compaction, context tracker |
//! | [`error`] | [`BudgetError`] and [`TrackerWarning`] |
//! | [`events`] | Event handler seam |
//! | [`persist`] | State files and schema |
//! | [`quota`] | Usage window and quota tracker |

pub mod amount;
pub mod budget;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod persist;
pub mod prelude;
pub mod quota;

pub use amount::TokenAmount;
pub use config::WardenConfig;
pub use context::ContextTracker;
pub use error::{BudgetError, TrackerWarning};
pub use quota::QuotaTracker;
