//! Error and warning taxonomy.
//!
//! Two kinds of trouble come out of the trackers. A [`BudgetError`] means the
//! call itself failed and the caller has to act on it: the amount or a
//! setting was rejected, or the state could not be written to disk. A
//! [`TrackerWarning`] means something was off but got corrected in place (a
//! timestamp clamped, a corrupt state file replaced by an empty one, a
//! compaction capped). Warnings never interrupt tracking; they are logged,
//! forwarded to the tracker's event handler and queued for
//! [`take_warnings`](crate::QuotaTracker::take_warnings).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::context::ledger::UsageCategory;

/// Errors returned synchronously to the caller of a tracker operation.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// `record_usage` got a negative, non-finite or fractional amount.
    /// Tracker state is unchanged.
    #[error("invalid token amount: {reason}")]
    InvalidAmount { reason: String },

    /// Writing the state file failed. The in-memory tracker is still valid.
    #[error("failed to persist state to {}: {source}", path.display())]
    PersistenceFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A threshold table was empty, did not start at 0% or was not strictly
    /// ascending.
    #[error("invalid threshold table: {reason}")]
    InvalidThresholdTable { reason: String },

    /// A tracker setting such as the quota window length was out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The state could not be encoded as JSON.
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl BudgetError {
    pub(crate) fn invalid_amount(reason: impl Into<String>) -> Self {
        Self::InvalidAmount {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PersistenceFailure {
            path: path.into(),
            source,
        }
    }
}

/// Non-fatal conditions that were corrected in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerWarning {
    /// The state file could not be parsed, failed schema validation or carried
    /// an unknown schema version. The scope restarted from empty.
    CorruptPersistedState { path: PathBuf, reason: String },
    /// An event timestamp was older than the newest recorded event or too far
    /// in the future, and was clamped to the current time.
    ClockAnomaly {
        supplied: DateTime<Utc>,
        clamped_to: DateTime<Utc>,
    },
    /// A compaction asked to remove more than a category still held.
    CompactionOverreach {
        category: UsageCategory,
        requested: u64,
        removed: u64,
    },
}

impl std::fmt::Display for TrackerWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerWarning::CorruptPersistedState { path, reason } => write!(
                f,
                "corrupt state at {} ({reason}); starting from empty",
                path.display()
            ),
            TrackerWarning::ClockAnomaly {
                supplied,
                clamped_to,
            } => write!(
                f,
                "event timestamp {} out of order; clamped to {}",
                supplied.to_rfc3339(),
                clamped_to.to_rfc3339()
            ),
            TrackerWarning::CompactionOverreach {
                category,
                requested,
                removed,
            } => write!(
                f,
                "compaction of {category} requested {requested} tokens but only {removed} were removable"
            ),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = BudgetError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_amount_message() {
        let err = BudgetError::invalid_amount("amount -5 is negative");
        assert_eq!(err.to_string(), "invalid token amount: amount -5 is negative");
    }

    #[test]
    fn invalid_config_message() {
        let err = BudgetError::invalid_config("retention must be positive");
        assert_eq!(err.to_string(), "invalid configuration: retention must be positive");
    }

    #[test]
    fn persistence_failure_names_path() {
        let err = BudgetError::persistence(
            "/tmp/state.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/state.json"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn warning_serializes_with_kind_tag() {
        let warning = TrackerWarning::CompactionOverreach {
            category: UsageCategory::FileRead,
            requested: 100,
            removed: 40,
        };
        let json = serde_json::to_value(&warning).unwrap();
        assert_eq!(json["kind"], "compaction_overreach");
        assert_eq!(json["category"], "file-read");
        assert_eq!(json["removed"], 40);
    }
}
