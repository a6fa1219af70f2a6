//! Top-level configuration with sensible defaults.
//!
//! [`WardenConfig`] bundles the state directory with the quota and context
//! settings and opens trackers from them.

use crate::context::tracker::{ContextConfig, ContextTracker};
use crate::error::Result;
use crate::persist::StateDir;
use crate::quota::tracker::{QuotaConfig, QuotaTracker};
use std::path::PathBuf;

/// Default directory for persisted tracker state.
pub const DEFAULT_STATE_DIR: &str = ".agents/budget";

/// Default quota scope id.
pub const DEFAULT_QUOTA_SCOPE: &str = "default";

#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub state_dir: PathBuf,
    pub quota: QuotaConfig,
    pub context: ContextConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            quota: QuotaConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl WardenConfig {
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_quota(mut self, quota: QuotaConfig) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn state(&self) -> StateDir {
        StateDir::new(&self.state_dir)
    }

    /// Open the persisted quota tracker for `scope`. Fails when the quota
    /// settings are out of range.
    pub fn open_quota(&self, scope: &str) -> Result<QuotaTracker> {
        QuotaTracker::open(scope, self.quota.clone(), &self.state())
    }

    /// Open (or resume) the persisted context session `session_id`.
    pub fn open_context(&self, session_id: &str) -> ContextTracker {
        ContextTracker::open(session_id, self.context.clone(), &self.state())
    }
}
