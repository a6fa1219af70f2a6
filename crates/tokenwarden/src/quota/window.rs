//! Sliding time window of usage events.
//!
//! Events are appended in timestamp order and dropped from the front once
//! they are `retention` old. Pruning only happens when the window is queried,
//! so no timer is needed, and it only ever moves forward: an event pruned at
//! one query never reappears at a later one, even if that query asks about an
//! earlier instant.

use crate::amount::TokenAmount;
use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::trace;

/// A single recorded usage delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UsageEvent {
    pub amount: TokenAmount,
    pub timestamp: DateTime<Utc>,
}

/// Ordered events with a fixed retention.
#[derive(Debug, Clone)]
pub struct UsageWindow {
    retention: Duration,
    events: VecDeque<UsageEvent>,
    /// Running sum of `events`, kept in step with pushes and prunes.
    total: u64,
}

impl UsageWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            events: VecDeque::new(),
            total: 0,
        }
    }

    /// Rebuild a window from persisted events. Events are sorted by timestamp
    /// so the ordering invariant holds even for hand-edited files.
    pub fn from_events(
        retention: Duration,
        events: impl IntoIterator<Item = UsageEvent>,
    ) -> Self {
        let mut sorted: Vec<UsageEvent> = events.into_iter().collect();
        sorted.sort_by_key(|e| e.timestamp);
        let total = sorted
            .iter()
            .map(|e| e.amount.get())
            .fold(0, u64::saturating_add);
        Self {
            retention,
            events: sorted.into(),
            total,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Timestamp of the newest event still held.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.back().map(|e| e.timestamp)
    }

    /// Append an event. The caller guarantees `timestamp` is not older than
    /// [`latest_timestamp`](Self::latest_timestamp).
    pub fn push(&mut self, amount: TokenAmount, timestamp: DateTime<Utc>) {
        debug_assert!(self.latest_timestamp().is_none_or(|t| t <= timestamp));
        self.total = self.total.saturating_add(amount.get());
        self.events.push_back(UsageEvent { amount, timestamp });
    }

    /// Drop every event with `timestamp <= now - retention`. Returns the
    /// number of events removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        // A cutoff before the representable range means nothing has expired.
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return 0;
        };
        let mut removed = 0;
        while let Some(front) = self.events.front()
            && front.timestamp <= cutoff
        {
            self.total = self.total.saturating_sub(front.amount.get());
            self.events.pop_front();
            removed += 1;
        }
        if removed > 0 {
            trace!("pruned {removed} expired usage event(s), live total now {}", self.total);
        }
        removed
    }

    /// Live total as of `now`.
    pub fn total_at(&mut self, now: DateTime<Utc>) -> u64 {
        self.prune(now);
        self.total
    }

    /// Time until the oldest live event expires, i.e. until the total next
    /// decreases. Zero when nothing is live.
    pub fn time_to_next_expiry(&mut self, now: DateTime<Utc>) -> Duration {
        self.prune(now);
        match self.events.front() {
            Some(oldest) => oldest
                .timestamp
                .checked_add_signed(self.retention)
                .map_or(Duration::MAX, |expiry| (expiry - now).max(Duration::zero())),
            None => Duration::zero(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> impl Iterator<Item = &UsageEvent> {
        self.events.iter()
    }
}
