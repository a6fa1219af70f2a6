//! Rolling-window quota tracker.
//!
//! A [`QuotaTracker`] answers "how much of the trailing-window quota is
//! used, what remains and when does it next free up". It owns a single
//! [`UsageWindow`], classifies it against the quota [`ThresholdTable`] and
//! announces each upward tier crossing once. The window never resets as a
//! discrete event; it decays as usage ages out, and once it is completely
//! empty the announcement history is cleared as well.
//!
//! # Example
//!
//! ```ignore
//! let dir = StateDir::new(".agents/budget");
//! let mut quota = QuotaTracker::open("default", QuotaConfig::default(), &dir)?
//!     .with_handler(LoggingHandler);
//!
//! if let Some(n) = quota.record_usage(12_000)? {
//!     println!("{}", n.message);
//! }
//! println!("{}", quota.status().to_log_string());
//! ```

use super::window::UsageWindow;
use crate::amount::TokenAmount;
use crate::budget::classifier::{BudgetStatus, ThresholdTable, classify};
use crate::budget::notification::{Notification, NotificationState};
use crate::clock::{Clock, SystemClock};
use crate::error::{BudgetError, Result, TrackerWarning};
use crate::events::{BudgetEvent, EventHandler, EventSink};
use crate::persist::{LoadOutcome, PersistedState, StateDir, StateStore};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

/// Default quota per window.
pub const DEFAULT_QUOTA_LIMIT: u64 = 200_000;
/// Default window length.
pub const DEFAULT_RETENTION_HOURS: i64 = 5;
/// How far ahead of the clock a supplied timestamp may be.
pub const DEFAULT_FUTURE_TOLERANCE_MINUTES: i64 = 5;
/// Longest accepted window length and future tolerance.
pub const MAX_RETENTION_DAYS: i64 = 366;

// ── QuotaConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Tokens allowed within one window.
    pub limit: u64,
    /// Window length; events older than this no longer count.
    pub retention: Duration,
    pub thresholds: ThresholdTable,
    /// Timestamps further than this past "now" are clamped.
    pub future_tolerance: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUOTA_LIMIT,
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            thresholds: ThresholdTable::quota(),
            future_tolerance: Duration::minutes(DEFAULT_FUTURE_TOLERANCE_MINUTES),
        }
    }
}

impl QuotaConfig {
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdTable) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_future_tolerance(mut self, tolerance: Duration) -> Self {
        self.future_tolerance = tolerance;
        self
    }

    /// Reject a window that is not positive or longer than
    /// [`MAX_RETENTION_DAYS`], and a negative or oversized future tolerance.
    pub fn validate(&self) -> Result<()> {
        let max = Duration::days(MAX_RETENTION_DAYS);
        if self.retention <= Duration::zero() || self.retention > max {
            return Err(BudgetError::invalid_config(format!(
                "retention must be between 1s and {MAX_RETENTION_DAYS} days, got {}s",
                self.retention.num_seconds()
            )));
        }
        if self.future_tolerance < Duration::zero() || self.future_tolerance > max {
            return Err(BudgetError::invalid_config(format!(
                "future tolerance must be between 0s and {MAX_RETENTION_DAYS} days, got {}s",
                self.future_tolerance.num_seconds()
            )));
        }
        Ok(())
    }
}

// ── QuotaTracker ───────────────────────────────────────────────────

pub struct QuotaTracker {
    scope: String,
    config: QuotaConfig,
    window: UsageWindow,
    notifications: NotificationState,
    store: Option<StateStore>,
    clock: Box<dyn Clock>,
    events: EventSink,
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("scope", &self.scope)
            .field("config", &self.config)
            .field("window", &self.window)
            .field("notifications", &self.notifications)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl QuotaTracker {
    /// In-memory tracker; nothing is persisted. Fails with
    /// [`BudgetError::InvalidConfig`] when the config does not
    /// [`validate`](QuotaConfig::validate).
    pub fn new(scope: impl Into<String>, config: QuotaConfig) -> Result<Self> {
        config.validate()?;
        let window = UsageWindow::new(config.retention);
        Ok(Self {
            scope: scope.into(),
            config,
            window,
            notifications: NotificationState::new(),
            store: None,
            clock: Box::new(SystemClock),
            events: EventSink::default(),
        })
    }

    /// Tracker backed by `dir/quota/{scope}.json`, restoring whatever state
    /// the file holds. A corrupt file starts the scope empty and queues a
    /// [`TrackerWarning::CorruptPersistedState`].
    pub fn open(scope: impl Into<String>, config: QuotaConfig, dir: &StateDir) -> Result<Self> {
        let mut tracker = Self::new(scope, config)?;
        let store = dir.quota_store(&tracker.scope);

        match store.load() {
            LoadOutcome::Fresh => debug!("[{}] no quota state yet", tracker.scope),
            LoadOutcome::Loaded(state) => {
                tracker.window = UsageWindow::from_events(
                    tracker.config.retention,
                    state.events.unwrap_or_default(),
                );
                tracker.notifications = NotificationState::from_label(
                    state.notification.highest_level_fired.as_deref(),
                    &tracker.config.thresholds,
                );
                info!(
                    "[{}] restored {} quota event(s) from {}",
                    tracker.scope,
                    tracker.window.len(),
                    store.path().display()
                );
            }
            LoadOutcome::Corrupt(warning) => tracker.events.warn(&tracker.scope, warning),
        }

        tracker.store = Some(store);
        Ok(tracker)
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Attach the single listener for this tracker's events.
    pub fn with_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events.set_handler(&self.scope, Box::new(handler));
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    // ── Commands ───────────────────────────────────────────────────

    /// Record usage at the current instant.
    ///
    /// Returns the notification this usage triggered, if any. An invalid
    /// amount is rejected before anything changes. On
    /// [`BudgetError::PersistenceFailure`] the usage stays recorded in memory
    /// and any notification has already gone to the event handler.
    pub fn record_usage<A>(&mut self, amount: A) -> Result<Option<Notification>>
    where
        A: TryInto<TokenAmount, Error = BudgetError>,
    {
        let amount = amount.try_into()?;
        self.record(amount, None)
    }

    /// Record usage with a producer-supplied timestamp. Timestamps older than
    /// the newest recorded event, or too far in the future, are clamped with
    /// a [`TrackerWarning::ClockAnomaly`].
    pub fn record_usage_at<A>(
        &mut self,
        amount: A,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<Notification>>
    where
        A: TryInto<TokenAmount, Error = BudgetError>,
    {
        let amount = amount.try_into()?;
        self.record(amount, Some(timestamp))
    }

    fn record(
        &mut self,
        amount: TokenAmount,
        supplied: Option<DateTime<Utc>>,
    ) -> Result<Option<Notification>> {
        let now = self.clock.now();
        let timestamp = self.checked_timestamp(supplied.unwrap_or(now), now);

        self.window.prune(now);
        self.window.push(amount, timestamp);
        debug!(
            "[{}] recorded {amount} tokens at {}",
            self.scope,
            timestamp.to_rfc3339()
        );

        let notification = self.observe(now);
        self.persist(now)?;
        Ok(notification)
    }

    /// Keep the window ordered and free of far-future events.
    fn checked_timestamp(&mut self, supplied: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        let latest = self.window.latest_timestamp();
        let before_latest = latest.is_some_and(|l| supplied < l);
        let too_far_ahead = now
            .checked_add_signed(self.config.future_tolerance)
            .is_some_and(|limit| supplied > limit);
        if !before_latest && !too_far_ahead {
            return supplied;
        }

        let clamped_to = latest.map_or(now, |l| l.max(now));
        self.events.warn(
            &self.scope,
            TrackerWarning::ClockAnomaly {
                supplied,
                clamped_to,
            },
        );
        clamped_to
    }

    /// Compare the current tier with what has already been announced.
    ///
    /// Returns a notification when usage sits in a tier above the highest
    /// one announced so far. When usage has aged out below that tier, the
    /// high-water mark drops to match so a later climb is announced again.
    pub fn check_warnings(&mut self) -> Result<Option<Notification>> {
        let now = self.clock.now();
        let pruned = self.window.prune(now);
        let before = self.notifications.clone();

        let notification = self.observe(now);
        if pruned > 0 || self.notifications != before {
            self.persist(now)?;
        }
        Ok(notification)
    }

    fn observe(&mut self, now: DateTime<Utc>) -> Option<Notification> {
        if self.window.is_empty() && self.notifications.highest_fired().is_some() {
            debug!("[{}] window drained, re-arming notifications", self.scope);
            self.notifications.reset();
        }

        let status = self.status_at(now);
        let notification = self
            .notifications
            .observe(&self.scope, &status, &self.config.thresholds)?;
        info!("[{}] {}", self.scope, notification.message);
        self.events.emit(&BudgetEvent::ThresholdCrossed(&notification));
        Some(notification)
    }

    fn persist(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut state = PersistedState::new(&self.scope, now);
        state.events = Some(self.window.events().copied().collect());
        state.notification.highest_level_fired =
            self.notifications.highest_label(&self.config.thresholds);
        store.save(&state)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Live total as of `now`.
    pub fn usage_at(&mut self, now: DateTime<Utc>) -> u64 {
        self.window.total_at(now)
    }

    pub fn usage(&mut self) -> u64 {
        let now = self.clock.now();
        self.usage_at(now)
    }

    fn status_at(&mut self, now: DateTime<Utc>) -> BudgetStatus {
        let used = self.window.total_at(now);
        classify(used, self.config.limit, &self.config.thresholds)
    }

    pub fn status(&mut self) -> BudgetStatus {
        let now = self.clock.now();
        self.status_at(now)
    }

    pub fn remaining(&mut self) -> u64 {
        self.config.limit.saturating_sub(self.usage())
    }

    /// Time until the oldest live event expires, i.e. until the total next
    /// goes down. Zero when nothing is live.
    pub fn time_to_reset(&mut self) -> Duration {
        let now = self.clock.now();
        self.window.time_to_next_expiry(now)
    }

    /// Drain warnings accumulated since the last call.
    pub fn take_warnings(&mut self) -> Vec<TrackerWarning> {
        self.events.take_warnings()
    }
}
