//! On-disk tracker state.
//!
//! Every scope gets one JSON file. Quota scopes live under `quota/`, context
//! sessions under `sessions/`:
//!
//! ```text
//! .agents/budget/
//! ├── quota/
//! │   └── default.json
//! └── sessions/
//!     ├── 2026-05-04-a1.json
//!     └── 2026-05-05-b7.json
//! ```
//!
//! Writes are atomic (temp file, then rename) so a crash mid-write leaves the
//! previous state in place. Loads never fail: a missing file is a fresh
//! scope, and anything unreadable, malformed, schema-invalid or carrying an
//! unknown `schemaVersion` comes back as [`LoadOutcome::Corrupt`] so the
//! tracker can start empty and report a warning.

use crate::error::{BudgetError, Result, TrackerWarning};
use crate::context::ledger::{LedgerItem, UsageCategory};
use crate::quota::window::UsageEvent;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Version written into every state file.
pub const SCHEMA_VERSION: u32 = 1;

// ── PersistedState ─────────────────────────────────────────────────

/// Serialized state of one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub schema_version: u32,
    pub scope_id: String,
    pub last_updated: DateTime<Utc>,
    /// Quota scopes: live window events, oldest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<UsageEvent>>,
    /// Context scopes: per-category totals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<BTreeMap<UsageCategory, u64>>,
    /// Context scopes: the items behind `categories`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<PersistedItem>>,
    #[serde(default)]
    pub notification: PersistedNotification,
}

impl PersistedState {
    pub fn new(scope_id: impl Into<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            scope_id: scope_id.into(),
            last_updated,
            events: None,
            categories: None,
            items: None,
            notification: PersistedNotification::default(),
        }
    }

    /// Sum of whatever usage the file records.
    pub fn total(&self) -> u64 {
        let events = self
            .events
            .iter()
            .flatten()
            .map(|e| e.amount.get())
            .fold(0, u64::saturating_add);
        let categories = self
            .categories
            .iter()
            .flat_map(|c| c.values().copied())
            .fold(0, u64::saturating_add);
        events.saturating_add(categories)
    }
}

/// A ledger item tagged with its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistedItem {
    pub category: UsageCategory,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl From<(UsageCategory, LedgerItem)> for PersistedItem {
    fn from((category, item): (UsageCategory, LedgerItem)) -> Self {
        Self {
            category,
            amount: item.amount,
            label: item.label,
            recorded_at: item.recorded_at,
        }
    }
}

impl From<PersistedItem> for (UsageCategory, LedgerItem) {
    fn from(item: PersistedItem) -> Self {
        (
            item.category,
            LedgerItem {
                amount: item.amount,
                label: item.label,
                recorded_at: item.recorded_at,
            },
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNotification {
    /// Label of the highest tier already announced, or `null`.
    pub highest_level_fired: Option<String>,
}

/// JSON Schema of [`PersistedState`], as used to validate loads.
pub fn persisted_state_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(PersistedState);
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// Check `value` against [`persisted_state_schema`]. Returns one line per
/// violation, or `None` when the document is valid.
fn validate_state(value: &serde_json::Value) -> Option<String> {
    let schema = persisted_state_schema();
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(e) => {
            debug!("state schema failed to compile, skipping validation: {e}");
            return None;
        }
    };

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}

// ── StateStore ─────────────────────────────────────────────────────

/// What [`StateStore::load`] found.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// No state file yet.
    Fresh,
    Loaded(PersistedState),
    /// The file exists but cannot be used.
    Corrupt(TrackerWarning),
}

/// One scope's state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).map_err(|e| BudgetError::persistence(dir, e))?;
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, json).map_err(|e| BudgetError::persistence(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| BudgetError::persistence(&self.path, e))?;
        debug!("persisted {} to {}", state.scope_id, self.path.display());
        Ok(())
    }

    pub fn load(&self) -> LoadOutcome {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadOutcome::Fresh,
            Err(e) => return self.corrupt(format!("unreadable: {e}")),
        };

        let value: serde_json::Value = match serde_json::from_str(&json) {
            Ok(v) => v,
            Err(e) => return self.corrupt(format!("invalid JSON: {e}")),
        };

        // Checked before full validation so a future version is reported as
        // such rather than as a pile of schema errors.
        if let Some(version) = value.get("schemaVersion").and_then(|v| v.as_u64())
            && version != u64::from(SCHEMA_VERSION)
        {
            return self.corrupt(format!("unknown schemaVersion {version}"));
        }

        if let Some(errors) = validate_state(&value) {
            return self.corrupt(format!("schema validation failed: {errors}"));
        }

        match serde_json::from_value::<PersistedState>(value) {
            Ok(state) => LoadOutcome::Loaded(state),
            Err(e) => self.corrupt(format!("malformed state: {e}")),
        }
    }

    fn corrupt(&self, reason: String) -> LoadOutcome {
        LoadOutcome::Corrupt(TrackerWarning::CorruptPersistedState {
            path: self.path.clone(),
            reason,
        })
    }
}

// ── StateDir ───────────────────────────────────────────────────────

/// Summary of a persisted context session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub last_updated: DateTime<Utc>,
    pub total: u64,
    pub highest_level_fired: Option<String>,
}

/// Root directory holding every scope's state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn quota_store(&self, scope_id: &str) -> StateStore {
        StateStore::new(self.root.join("quota").join(file_name(scope_id)))
    }

    pub fn session_store(&self, session_id: &str) -> StateStore {
        StateStore::new(self.sessions_dir().join(file_name(session_id)))
    }

    /// Every readable session, most recently updated first. Unreadable or
    /// corrupt files are skipped with a warning.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let dir = self.sessions_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BudgetError::persistence(dir, e)),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BudgetError::persistence(&dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            match StateStore::new(&path).load() {
                LoadOutcome::Loaded(state) => sessions.push(SessionSummary {
                    total: state.total(),
                    session_id: state.scope_id,
                    last_updated: state.last_updated,
                    highest_level_fired: state.notification.highest_level_fired,
                }),
                LoadOutcome::Corrupt(warning) => warn!("Skipping session file: {warning}"),
                LoadOutcome::Fresh => {}
            }
        }
        sessions.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(sessions)
    }

    /// Delete a session's state file. Returns whether a file was removed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let store = self.session_store(session_id);
        match std::fs::remove_file(store.path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BudgetError::persistence(store.path(), e)),
        }
    }
}

/// Map a scope id to a file name, replacing anything that could escape the
/// directory.
fn file_name(scope_id: &str) -> String {
    let stem: String = scope_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_start_matches('.');
    if stem.is_empty() {
        "_.json".to_string()
    } else {
        format!("{stem}.json")
    }
}
