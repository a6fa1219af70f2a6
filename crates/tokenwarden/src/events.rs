//! Events and the single-listener handler seam for the trackers.
//!
//! Every tracker owns at most one [`EventHandler`]. Threshold crossings,
//! compaction runs, session resets and corrected anomalies are pushed to it
//! as [`BudgetEvent`]s, in addition to being returned from the call that
//! caused them. There is no global registry; whoever constructs a tracker
//! decides who listens.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests, or callers that only use return values |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Closures, e.g. forwarding into an `mpsc` channel |

use crate::budget::notification::{Notification, Urgency};
use crate::context::compaction::CompactionResult;
use crate::error::TrackerWarning;
use tracing::{info, warn};

/// Events emitted by the trackers.
#[derive(Debug)]
pub enum BudgetEvent<'a> {
    /// Usage climbed into a tier not yet announced for the scope.
    ThresholdCrossed(&'a Notification),
    /// A compaction was executed against a context ledger.
    CompactionCompleted {
        scope: &'a str,
        result: &'a CompactionResult,
    },
    /// A context session was reset (new session or confirmed restart).
    SessionReset {
        scope: &'a str,
        discarded_tokens: u64,
    },
    /// A non-fatal anomaly was corrected in place.
    Warning {
        scope: &'a str,
        warning: &'a TrackerWarning,
    },
}

/// Listener for [`BudgetEvent`]s.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &BudgetEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// Logs events through `tracing`. High-urgency crossings and warnings log at
/// WARN, everything else at INFO.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &BudgetEvent<'_>) {
        match event {
            BudgetEvent::ThresholdCrossed(n) => match n.urgency {
                Urgency::High => warn!("[{}] {}", n.scope, n.message),
                Urgency::Normal => info!("[{}] {}", n.scope, n.message),
            },
            BudgetEvent::CompactionCompleted { scope, result } => info!(
                "[{scope}] {} compaction freed {} tokens ({} -> {})",
                result.level, result.actual_savings, result.before, result.after
            ),
            BudgetEvent::SessionReset {
                scope,
                discarded_tokens,
            } => info!("[{scope}] session reset, {discarded_tokens} tokens discarded"),
            BudgetEvent::Warning { scope, warning } => warn!("[{scope}] {warning}"),
        }
    }
}

/// An event handler backed by a closure.
///
/// ```ignore
/// let (tx, rx) = std::sync::mpsc::channel();
/// let handler = FnEventHandler::new(move |event| {
///     if let BudgetEvent::ThresholdCrossed(n) = event {
///         let _ = tx.send((*n).clone());
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&BudgetEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&BudgetEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&BudgetEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &BudgetEvent<'_>) {
        (self.0)(event)
    }
}

// ── EventSink ──────────────────────────────────────────────────────

/// A tracker's listener plus its queue of undrained warnings.
#[derive(Default)]
pub(crate) struct EventSink {
    handler: Option<Box<dyn EventHandler>>,
    pending: Vec<TrackerWarning>,
}

impl EventSink {
    /// Install the listener. Warnings queued before it was attached (e.g. a
    /// corrupt state file found while opening) are replayed to it.
    pub(crate) fn set_handler(&mut self, scope: &str, handler: Box<dyn EventHandler>) {
        for warning in &self.pending {
            handler.on_event(&BudgetEvent::Warning { scope, warning });
        }
        self.handler = Some(handler);
    }

    pub(crate) fn emit(&self, event: &BudgetEvent<'_>) {
        if let Some(handler) = &self.handler {
            handler.on_event(event);
        }
    }

    pub(crate) fn warn(&mut self, scope: &str, warning: TrackerWarning) {
        warn!("[{scope}] {warning}");
        self.emit(&BudgetEvent::Warning {
            scope,
            warning: &warning,
        });
        self.pending.push(warning);
    }

    pub(crate) fn take_warnings(&mut self) -> Vec<TrackerWarning> {
        std::mem::take(&mut self.pending)
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("has_handler", &self.handler.is_some())
            .field("pending", &self.pending)
            .finish()
    }
}
