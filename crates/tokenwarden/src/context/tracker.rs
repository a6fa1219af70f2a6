//! Session-scoped context budget tracker.
//!
//! A [`ContextTracker`] accumulates what a session has put into the model's
//! context, broken down by [`UsageCategory`], and classifies the total
//! against a limit set below the model's hard ceiling (the safety margin).
//! Usage only goes down through an explicit compaction or a session reset.
//!
//! ```ignore
//! let dir = StateDir::new(".agents/budget");
//! let mut context = ContextTracker::open("2026-05-04-a1", ContextConfig::default(), &dir);
//! context.record_item(UsageCategory::FileRead, 2_400, "src/main.rs")?;
//!
//! if let Some(level) = context.suggested_compaction() {
//!     let preview = context.plan(level);
//!     println!("{level} compaction would free {} tokens", preview.estimated_savings);
//!     context.execute_plan(&preview)?;
//! }
//! ```

use super::compaction::{self, CompactionLevel, CompactionPlan, CompactionPolicy, CompactionResult};
use super::ledger::{CategoryLedger, LedgerItem, UsageBreakdown, UsageCategory};
use crate::amount::TokenAmount;
use crate::budget::classifier::{BudgetStatus, ThresholdTable, Tier, classify};
use crate::budget::notification::{Notification, NotificationState};
use crate::clock::{Clock, SystemClock};
use crate::error::{BudgetError, Result, TrackerWarning};
use crate::events::{BudgetEvent, EventHandler, EventSink};
use crate::persist::{LoadOutcome, PersistedItem, PersistedState, StateDir, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Nominal context window of the model.
pub const DEFAULT_CONTEXT_MAX_TOKENS: u64 = 200_000;
/// Share of the nominal window the budget is classified against.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.90;

// ── ContextConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_tokens: u64,
    /// Fraction of `max_tokens` treated as the usable limit.
    pub safety_margin: f64,
    pub thresholds: ThresholdTable,
    pub policy: CompactionPolicy,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_CONTEXT_MAX_TOKENS,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            thresholds: ThresholdTable::context(),
            policy: CompactionPolicy::default(),
        }
    }
}

impl ContextConfig {
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdTable) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_policy(mut self, policy: CompactionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The limit usage is classified against: `max_tokens * safety_margin`.
    pub fn effective_limit(&self) -> u64 {
        let margin = if self.safety_margin.is_finite() {
            self.safety_margin.clamp(0.0, 1.0)
        } else {
            1.0
        };
        (self.max_tokens as f64 * margin).round() as u64
    }
}

// ── CompactionOpportunities ────────────────────────────────────────

/// Tokens removable at each compaction level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelSavings {
    pub soft: u64,
    pub strategic: u64,
    pub emergency: u64,
}

impl LevelSavings {
    pub fn get(&self, level: CompactionLevel) -> u64 {
        match level {
            CompactionLevel::Soft => self.soft,
            CompactionLevel::Strategic => self.strategic,
            CompactionLevel::Emergency => self.emergency,
        }
    }

    fn set(&mut self, level: CompactionLevel, tokens: u64) {
        match level {
            CompactionLevel::Soft => self.soft = tokens,
            CompactionLevel::Strategic => self.strategic = tokens,
            CompactionLevel::Emergency => self.emergency = tokens,
        }
    }
}

/// Read-only projection of every compaction level over the current ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionOpportunities {
    pub per_category: BTreeMap<UsageCategory, LevelSavings>,
    pub totals: LevelSavings,
}

// ── ContextTracker ─────────────────────────────────────────────────

pub struct ContextTracker {
    session_id: String,
    config: ContextConfig,
    ledger: CategoryLedger,
    notifications: NotificationState,
    dir: Option<StateDir>,
    store: Option<StateStore>,
    clock: Box<dyn Clock>,
    events: EventSink,
}

impl std::fmt::Debug for ContextTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTracker")
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .field("ledger", &self.ledger)
            .field("notifications", &self.notifications)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ContextTracker {
    /// In-memory tracker; nothing is persisted.
    pub fn new(session_id: impl Into<String>, config: ContextConfig) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            ledger: CategoryLedger::new(),
            notifications: NotificationState::new(),
            dir: None,
            store: None,
            clock: Box::new(SystemClock),
            events: EventSink::default(),
        }
    }

    /// Tracker backed by `dir/sessions/{session_id}.json`, resuming the
    /// session if the file exists. A corrupt file starts the session empty
    /// and queues a [`TrackerWarning::CorruptPersistedState`].
    pub fn open(session_id: impl Into<String>, config: ContextConfig, dir: &StateDir) -> Self {
        let mut tracker = Self::new(session_id, config);
        let store = dir.session_store(&tracker.session_id);

        match store.load() {
            LoadOutcome::Fresh => debug!("[{}] new context session", tracker.session_id),
            LoadOutcome::Loaded(state) => {
                let restored_at = state.last_updated;
                tracker.ledger = CategoryLedger::from_parts(
                    &state.categories.unwrap_or_default(),
                    state
                        .items
                        .unwrap_or_default()
                        .into_iter()
                        .map(<(UsageCategory, LedgerItem)>::from),
                    restored_at,
                );
                tracker.notifications = NotificationState::from_label(
                    state.notification.highest_level_fired.as_deref(),
                    &tracker.config.thresholds,
                );
                info!(
                    "[{}] resumed context session at {} tokens",
                    tracker.session_id,
                    tracker.ledger.total()
                );
            }
            LoadOutcome::Corrupt(warning) => tracker.events.warn(&tracker.session_id, warning),
        }

        tracker.dir = Some(dir.clone());
        tracker.store = Some(store);
        tracker
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Attach the single listener for this tracker's events.
    pub fn with_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events.set_handler(&self.session_id, Box::new(handler));
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn ledger(&self) -> &CategoryLedger {
        &self.ledger
    }

    // ── Recording ──────────────────────────────────────────────────

    /// Add `amount` tokens to `category`.
    pub fn record_usage<A>(
        &mut self,
        category: UsageCategory,
        amount: A,
    ) -> Result<Option<Notification>>
    where
        A: TryInto<TokenAmount, Error = BudgetError>,
    {
        let amount = amount.try_into()?;
        self.record(category, amount, None)
    }

    /// Add a labelled item (file path, tool name) to `category`. Labels let
    /// the compaction policy keep "the most recent K" per tool.
    pub fn record_item<A>(
        &mut self,
        category: UsageCategory,
        amount: A,
        label: impl Into<String>,
    ) -> Result<Option<Notification>>
    where
        A: TryInto<TokenAmount, Error = BudgetError>,
    {
        let amount = amount.try_into()?;
        self.record(category, amount, Some(label.into()))
    }

    fn record(
        &mut self,
        category: UsageCategory,
        amount: TokenAmount,
        label: Option<String>,
    ) -> Result<Option<Notification>> {
        let now = self.clock.now();
        debug!("[{}] {category} +{amount}", self.session_id);
        self.ledger.record(category, amount.get(), label, now);

        let notification = self.observe();
        self.persist(now)?;
        Ok(notification)
    }

    fn observe(&mut self) -> Option<Notification> {
        let status = self.status();
        let notification = self
            .notifications
            .observe(&self.session_id, &status, &self.config.thresholds)?;
        info!("[{}] {}", self.session_id, notification.message);
        self.events.emit(&BudgetEvent::ThresholdCrossed(&notification));
        Some(notification)
    }

    fn persist(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut state = PersistedState::new(&self.session_id, now);
        state.categories = Some(self.ledger.breakdown().categories);
        state.items = Some(
            self.ledger
                .to_items()
                .into_iter()
                .map(PersistedItem::from)
                .collect(),
        );
        state.notification.highest_level_fired =
            self.notifications.highest_label(&self.config.thresholds);
        store.save(&state)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn usage(&self) -> UsageBreakdown {
        self.ledger.breakdown()
    }

    /// Status against the safety-margined limit.
    pub fn status(&self) -> BudgetStatus {
        classify(
            self.ledger.total(),
            self.config.effective_limit(),
            &self.config.thresholds,
        )
    }

    pub fn remaining(&self) -> u64 {
        self.config
            .effective_limit()
            .saturating_sub(self.ledger.total())
    }

    /// Tokens each level would remove, per category, without executing
    /// anything.
    pub fn identify_compaction_opportunities(&self) -> CompactionOpportunities {
        let mut opportunities = CompactionOpportunities::default();
        for level in CompactionLevel::ALL {
            let plan = self.plan(level);
            opportunities.totals.set(level, plan.estimated_savings);
            for (category, category_plan) in plan.per_category {
                opportunities
                    .per_category
                    .entry(category)
                    .or_default()
                    .set(level, category_plan.removable);
            }
        }
        opportunities
    }

    /// Compaction level the current tier calls for: the most severe tier
    /// suggests emergency, the one below it strategic, the one below that
    /// soft. Lower tiers suggest nothing.
    pub fn suggested_compaction(&self) -> Option<CompactionLevel> {
        let level = self.status().level;
        if level == Tier::BASELINE {
            return None;
        }
        let most_severe = self.config.thresholds.most_severe().index();
        match most_severe.saturating_sub(level.index()) {
            0 => Some(CompactionLevel::Emergency),
            1 => Some(CompactionLevel::Strategic),
            2 => Some(CompactionLevel::Soft),
            _ => None,
        }
    }

    /// Preview a compaction level. Never mutates the ledger.
    pub fn plan(&self, level: CompactionLevel) -> CompactionPlan {
        compaction::plan(&self.ledger, level, &self.config.policy)
    }

    // ── Compaction and reset ───────────────────────────────────────

    /// Plan and execute `level`.
    pub fn compact(&mut self, level: CompactionLevel) -> Result<CompactionResult> {
        let plan = self.plan(level);
        self.execute_plan(&plan)
    }

    /// Execute a plan previewed earlier. If the ledger shrank since, the
    /// removals are capped and reported as
    /// [`TrackerWarning::CompactionOverreach`].
    pub fn execute_plan(&mut self, plan: &CompactionPlan) -> Result<CompactionResult> {
        let now = self.clock.now();
        let result = compaction::execute_plan(&mut self.ledger, plan);
        info!(
            "[{}] {} compaction freed {} tokens ({} -> {}, estimated {})",
            self.session_id,
            result.level,
            result.actual_savings,
            result.before,
            result.after,
            result.estimated_savings
        );
        for warning in &result.warnings {
            self.events.warn(&self.session_id, warning.clone());
        }
        self.events.emit(&BudgetEvent::CompactionCompleted {
            scope: &self.session_id,
            result: &result,
        });

        // Lowers the high-water mark if compaction dropped a tier.
        self.observe();
        self.persist(now)?;
        Ok(result)
    }

    /// Zero the ledger and forget announced tiers, keeping the session id.
    pub fn reset(&mut self) -> Result<()> {
        let now = self.clock.now();
        self.clear();
        self.persist(now)
    }

    /// Start a new session: reset, then persist under `session_id` from now
    /// on. The previous session's file is left in place.
    pub fn begin_session(&mut self, session_id: impl Into<String>) -> Result<()> {
        let now = self.clock.now();
        self.clear();
        self.session_id = session_id.into();
        if let Some(dir) = &self.dir {
            self.store = Some(dir.session_store(&self.session_id));
        }
        info!("[{}] context session started", self.session_id);
        self.persist(now)
    }

    fn clear(&mut self) {
        let discarded_tokens = self.ledger.total();
        self.ledger.clear();
        self.notifications.reset();
        info!(
            "[{}] context reset, {discarded_tokens} tokens discarded",
            self.session_id
        );
        self.events.emit(&BudgetEvent::SessionReset {
            scope: &self.session_id,
            discarded_tokens,
        });
    }

    /// Drain warnings accumulated since the last call.
    pub fn take_warnings(&mut self) -> Vec<TrackerWarning> {
        self.events.take_warnings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::FnEventHandler;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap())
    }

    fn tracker() -> ContextTracker {
        ContextTracker::new("s1", ContextConfig::default()).with_clock(clock())
    }

    /// 20 file reads of 2,000, 4 grep results of 5,000, 30,000 of
    /// conversation.
    fn fill(context: &mut ContextTracker) {
        for i in 0..20 {
            context
                .record_item(UsageCategory::FileRead, 2_000, format!("src/f{i}.rs"))
                .unwrap();
        }
        for _ in 0..4 {
            context
                .record_item(UsageCategory::ToolResult, 5_000, "grep")
                .unwrap();
        }
        context
            .record_usage(UsageCategory::Conversation, 30_000)
            .unwrap();
    }

    #[test]
    fn effective_limit_applies_safety_margin() {
        assert_eq!(ContextConfig::default().effective_limit(), 180_000);
        let config = ContextConfig::default()
            .with_max_tokens(128_000)
            .with_safety_margin(f64::NAN);
        assert_eq!(config.effective_limit(), 128_000);
    }

    #[test]
    fn usage_and_status() {
        let mut context = tracker();
        fill(&mut context);

        let usage = context.usage();
        assert_eq!(usage.total, 90_000);
        assert_eq!(usage.categories[&UsageCategory::FileRead], 40_000);
        assert_eq!(usage.categories[&UsageCategory::ToolResult], 20_000);

        let status = context.status();
        assert_eq!(status.limit, 180_000);
        assert_eq!(status.percent, 50.0);
        assert_eq!(status.label, "elevated");
        assert_eq!(context.remaining(), 90_000);
    }

    #[test]
    fn invalid_amount_leaves_ledger_unchanged() {
        let mut context = tracker();
        context
            .record_usage(UsageCategory::Conversation, 100)
            .unwrap();
        let err = context
            .record_usage(UsageCategory::Conversation, -5)
            .unwrap_err();
        assert!(matches!(err, BudgetError::InvalidAmount { .. }));
        assert!(context.record_usage(UsageCategory::Conversation, 0.5).is_err());
        assert_eq!(context.usage().total, 100);
    }

    #[test]
    fn opportunities_match_plans_and_do_not_mutate() {
        let mut context = tracker();
        fill(&mut context);
        let before = context.usage();

        let opportunities = context.identify_compaction_opportunities();
        assert_eq!(context.usage(), before);

        let file_reads = opportunities.per_category[&UsageCategory::FileRead];
        assert_eq!(file_reads.soft, 20_000);
        assert_eq!(file_reads.strategic, 30_000);
        assert_eq!(file_reads.emergency, 34_000);
        let conversation = opportunities.per_category[&UsageCategory::Conversation];
        assert_eq!(conversation.soft, 0);
        assert_eq!(conversation.strategic, 15_000);
        assert_eq!(conversation.emergency, 22_500);

        for level in CompactionLevel::ALL {
            assert_eq!(
                opportunities.totals.get(level),
                context.plan(level).estimated_savings
            );
        }
    }

    #[test]
    fn soft_compaction_reports_and_emits() {
        let completed = Arc::new(Mutex::new(Vec::new()));
        let sink = completed.clone();
        let mut context = tracker().with_handler(FnEventHandler::new(move |event| {
            if let BudgetEvent::CompactionCompleted { result, .. } = event {
                sink.lock().unwrap().push(result.actual_savings);
            }
        }));
        fill(&mut context);

        let result = context.compact(CompactionLevel::Soft).unwrap();
        assert_eq!((result.before, result.after), (90_000, 70_000));
        assert_eq!(context.usage().categories[&UsageCategory::ToolResult], 20_000);
        assert_eq!(*completed.lock().unwrap(), vec![20_000]);

        // Replanning reflects the smaller ledger.
        assert_eq!(context.plan(CompactionLevel::Soft).estimated_savings, 0);
    }

    #[test]
    fn stale_plan_is_capped_and_warned() {
        let mut context = tracker();
        fill(&mut context);
        let preview = context.plan(CompactionLevel::Soft);
        context.compact(CompactionLevel::Emergency).unwrap();

        let result = context.execute_plan(&preview).unwrap();
        assert_eq!(result.actual_savings, 0);
        assert!(matches!(
            context.take_warnings().as_slice(),
            [TrackerWarning::CompactionOverreach { .. }]
        ));
    }

    #[test]
    fn compaction_rearms_notifications() {
        let mut context = tracker();
        fill(&mut context);
        let n = context
            .record_usage(UsageCategory::Conversation, 60_000)
            .unwrap()
            .unwrap();
        assert_eq!(n.label, "danger");

        context.compact(CompactionLevel::Strategic).unwrap();
        assert!(context.status().percent < 80.0);

        let n = context
            .record_usage(UsageCategory::Conversation, 80_000)
            .unwrap()
            .unwrap();
        assert_eq!(n.label, "danger");
    }

    #[test]
    fn suggested_level_follows_tier() {
        let mut context = tracker();
        assert_eq!(context.suggested_compaction(), None);

        context
            .record_usage(UsageCategory::Conversation, 90_000)
            .unwrap();
        assert_eq!(context.suggested_compaction(), Some(CompactionLevel::Soft));

        context
            .record_usage(UsageCategory::Conversation, 54_000)
            .unwrap();
        assert_eq!(context.suggested_compaction(), Some(CompactionLevel::Strategic));

        context
            .record_usage(UsageCategory::Conversation, 100_000)
            .unwrap();
        assert!(context.status().is_over_limit());
        assert_eq!(context.suggested_compaction(), Some(CompactionLevel::Emergency));
    }

    #[test]
    fn reset_zeroes_ledger_and_notifications() {
        let resets = Arc::new(Mutex::new(Vec::new()));
        let sink = resets.clone();
        let mut context = tracker().with_handler(FnEventHandler::new(move |event| {
            if let BudgetEvent::SessionReset {
                discarded_tokens, ..
            } = event
            {
                sink.lock().unwrap().push(*discarded_tokens);
            }
        }));
        assert!(
            context
                .record_usage(UsageCategory::Conversation, 50_000)
                .unwrap()
                .is_some()
        );

        context.reset().unwrap();
        assert_eq!(context.usage().total, 0);
        assert_eq!(*resets.lock().unwrap(), vec![50_000]);

        // The same tier is announced again in the fresh session.
        assert!(
            context
                .record_usage(UsageCategory::Conversation, 50_000)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn session_survives_restart_with_items() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = StateDir::new(dir.path());

        let preview = {
            let mut context = ContextTracker::open("s1", ContextConfig::default(), &state_dir)
                .with_clock(clock());
            fill(&mut context);
            context.plan(CompactionLevel::Emergency)
        };

        let mut context =
            ContextTracker::open("s1", ContextConfig::default(), &state_dir).with_clock(clock());
        assert!(context.take_warnings().is_empty());
        assert_eq!(context.usage().total, 90_000);
        assert_eq!(context.plan(CompactionLevel::Emergency), preview);
        // "elevated" was announced before the restart.
        assert!(
            context
                .record_usage(UsageCategory::Conversation, 1)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn begin_session_switches_files() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = StateDir::new(dir.path());
        let mut context =
            ContextTracker::open("first", ContextConfig::default(), &state_dir).with_clock(clock());
        context
            .record_usage(UsageCategory::Conversation, 1_000)
            .unwrap();

        context.begin_session("second").unwrap();
        assert_eq!(context.session_id(), "second");
        assert_eq!(context.usage().total, 0);
        context
            .record_usage(UsageCategory::Conversation, 10)
            .unwrap();

        let sessions = state_dir.list_sessions().unwrap();
        let mut totals: Vec<(String, u64)> = sessions
            .into_iter()
            .map(|s| (s.session_id, s.total))
            .collect();
        totals.sort();
        assert_eq!(
            totals,
            vec![("first".to_string(), 1_000), ("second".to_string(), 10)]
        );
    }

    #[test]
    fn restored_totals_keep_the_file_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = StateDir::new(dir.path());
        let saved_at = Utc.with_ymd_and_hms(2026, 5, 1, 7, 30, 0).unwrap();
        let mut state = PersistedState::new("s1", saved_at);
        state.categories = Some(BTreeMap::from([(UsageCategory::Conversation, 500)]));
        state_dir.session_store("s1").save(&state).unwrap();

        let context = ContextTracker::open("s1", ContextConfig::default(), &state_dir);
        let items = context.ledger().items(&UsageCategory::Conversation);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].amount, 500);
        assert_eq!(items[0].recorded_at, saved_at);
    }

    #[test]
    fn huge_amounts_saturate_the_total() {
        let mut context = tracker();
        context
            .record_item(UsageCategory::FileRead, u64::MAX, "big.bin")
            .unwrap();
        context
            .record_usage(UsageCategory::Conversation, 1)
            .unwrap();

        assert_eq!(context.usage().total, u64::MAX);
        assert_eq!(context.status().label, "critical");
        assert_eq!(context.remaining(), 0);
        let opportunities = context.identify_compaction_opportunities();
        assert!(opportunities.totals.emergency > 0);
    }
}
