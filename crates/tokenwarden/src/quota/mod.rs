//! Rolling time-window quota: the [`UsageWindow`] data structure and the
//! [`QuotaTracker`] built on it.

pub mod tracker;
pub mod window;

pub use tracker::{QuotaConfig, QuotaTracker};
pub use window::{UsageEvent, UsageWindow};
