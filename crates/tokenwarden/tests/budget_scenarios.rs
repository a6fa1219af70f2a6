//! End-to-end tracker scenarios against a real state directory.
//!
//! Each test drives the public API the way an event producer and a
//! dashboard would: record, query, restart, compact.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokenwarden::prelude::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
}

fn state_dir() -> (tempfile::TempDir, StateDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());
    (dir, state)
}

// ── Quota ────────────────────────────────────────────────────────────

#[test]
fn quota_window_expires_old_usage() {
    let clock = ManualClock::new(t0());
    let mut quota = QuotaTracker::new("default", QuotaConfig::default())
        .unwrap()
        .with_clock(clock.clone());

    quota.record_usage(50_000).unwrap();
    clock.advance(Duration::hours(2));
    quota.record_usage(30_000).unwrap();

    assert_eq!(quota.usage_at(t0() + Duration::hours(4)), 80_000);
    assert_eq!(quota.usage_at(t0() + Duration::minutes(301)), 30_000);
}

#[test]
fn quota_strategic_crossing_fires_once() {
    let (_dir, state) = state_dir();
    let clock = ManualClock::new(t0());
    let crossings = Arc::new(Mutex::new(Vec::new()));
    let sink = crossings.clone();

    let config = QuotaConfig::default().with_limit(200_000);
    let mut quota = QuotaTracker::open("default", config, &state)
        .unwrap()
        .with_clock(clock.clone())
        .with_handler(FnEventHandler::new(move |event| {
            if let BudgetEvent::ThresholdCrossed(n) = event {
                sink.lock().unwrap().push(n.label.clone());
            }
        }));

    let n = quota.record_usage(160_000).unwrap().unwrap();
    assert_eq!(n.label, "strategic");
    assert!(quota.record_usage(2_500).unwrap().is_none());
    assert_eq!(quota.usage(), 162_500);
    assert_eq!(*crossings.lock().unwrap(), vec!["strategic".to_string()]);

    // A fresh process picks up where this one left off, without re-alerting.
    let mut reopened = QuotaTracker::open("default", QuotaConfig::default(), &state)
        .unwrap()
        .with_clock(clock.clone());
    assert_eq!(reopened.usage(), 162_500);
    assert!(reopened.check_warnings().unwrap().is_none());
}

#[test]
fn corrupt_quota_file_starts_empty_with_warning() {
    let (dir, state) = state_dir();
    let path = dir.path().join("quota").join("default.json");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{\"schemaVersion\": 1, \"events\": [").unwrap();

    let warnings = Arc::new(Mutex::new(0));
    let counter = warnings.clone();
    let mut quota = QuotaTracker::open("default", QuotaConfig::default(), &state)
        .unwrap()
        .with_clock(ManualClock::new(t0()))
        .with_handler(FnEventHandler::new(move |event| {
            if let BudgetEvent::Warning { .. } = event {
                *counter.lock().unwrap() += 1;
            }
        }));

    assert_eq!(quota.usage(), 0);
    assert_eq!(*warnings.lock().unwrap(), 1);
    match quota.take_warnings().as_slice() {
        [TrackerWarning::CorruptPersistedState { path: reported, .. }] => {
            assert_eq!(reported, &path);
        }
        other => panic!("unexpected warnings: {other:?}"),
    }

    // The next write replaces the corrupt file with valid state.
    quota.record_usage(10).unwrap();
    let mut reopened = QuotaTracker::open("default", QuotaConfig::default(), &state)
        .unwrap()
        .with_clock(ManualClock::new(t0()));
    assert!(reopened.take_warnings().is_empty());
    assert_eq!(reopened.usage(), 10);
}

#[test]
fn future_schema_version_is_treated_as_corrupt() {
    let (dir, state) = state_dir();
    let path = dir.path().join("sessions").join("s1.json");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        r#"{"schemaVersion": 2, "scopeId": "s1", "lastUpdated": "2026-06-01T09:00:00Z",
            "categories": {"conversation": 500}, "notification": {"highestLevelFired": null}}"#,
    )
    .unwrap();

    let mut context = ContextTracker::open("s1", ContextConfig::default(), &state);
    assert_eq!(context.usage().total, 0);
    assert_eq!(context.take_warnings().len(), 1);
}

#[test]
fn negative_amount_is_rejected_everywhere() {
    let (_dir, state) = state_dir();
    let mut quota = QuotaTracker::open("default", QuotaConfig::default(), &state).unwrap();
    let mut context = ContextTracker::open("s1", ContextConfig::default(), &state);
    quota.record_usage(100).unwrap();
    context
        .record_usage(UsageCategory::Conversation, 100)
        .unwrap();

    assert!(matches!(
        quota.record_usage(-5),
        Err(BudgetError::InvalidAmount { .. })
    ));
    assert!(matches!(
        context.record_usage(UsageCategory::Conversation, -5),
        Err(BudgetError::InvalidAmount { .. })
    ));
    assert_eq!(quota.usage(), 100);
    assert_eq!(context.usage().total, 100);
}

// ── Context ──────────────────────────────────────────────────────────

#[test]
fn soft_compaction_keeps_ten_most_recent_reads_across_restart() {
    let (_dir, state) = state_dir();
    {
        let mut context = ContextTracker::open("s1", ContextConfig::default(), &state);
        for i in 0..20 {
            context
                .record_item(UsageCategory::FileRead, 2_000, format!("src/module_{i}.rs"))
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

    let mut context = ContextTracker::open("s1", ContextConfig::default(), &state);
    let preview = context.plan(CompactionLevel::Soft);
    assert_eq!(preview.estimated_savings, 20_000);
    assert_eq!(context.plan(CompactionLevel::Soft), preview);
    assert_eq!(context.usage().total, 90_000);

    let result = context.execute_plan(&preview).unwrap();
    assert_eq!(result.actual_savings, 20_000);

    let usage = context.usage();
    assert_eq!(usage.categories[&UsageCategory::FileRead], 20_000);
    assert_eq!(usage.categories[&UsageCategory::ToolResult], 20_000);
    assert_eq!(usage.categories[&UsageCategory::Conversation], 30_000);

    let reopened = ContextTracker::open("s1", ContextConfig::default(), &state);
    assert_eq!(reopened.usage(), usage);
}

#[test]
fn preserved_context_survives_emergency_compaction() {
    let mut context = ContextTracker::new("s1", ContextConfig::default());
    context
        .record_usage(UsageCategory::SystemPrompt, 6_000)
        .unwrap();
    context
        .record_usage(UsageCategory::Objective, 1_500)
        .unwrap();
    context
        .record_usage(UsageCategory::InProgressEdit, 3_000)
        .unwrap();
    context
        .record_usage(UsageCategory::ErrorContext, 2_000)
        .unwrap();
    context
        .record_usage(UsageCategory::Conversation, 150_000)
        .unwrap();
    context
        .record_usage(UsageCategory::VerboseOutput, 20_000)
        .unwrap();

    assert_eq!(context.suggested_compaction(), Some(CompactionLevel::Emergency));
    let before = context.usage();
    let result = context.compact(CompactionLevel::Emergency).unwrap();
    let after = context.usage();

    for category in [
        UsageCategory::SystemPrompt,
        UsageCategory::Objective,
        UsageCategory::InProgressEdit,
        UsageCategory::ErrorContext,
    ] {
        assert_eq!(after.categories[&category], before.categories[&category]);
    }
    assert_eq!(after.categories[&UsageCategory::Conversation], 37_500);
    assert_eq!(after.categories[&UsageCategory::VerboseOutput], 6_000);
    assert_eq!(result.actual_savings, result.estimated_savings);
    assert_eq!(result.before - result.after, result.actual_savings);
}

#[test]
fn new_session_resets_budget_and_keeps_history() {
    let (_dir, state) = state_dir();
    let mut context = ContextTracker::open("monday", ContextConfig::default(), &state);
    context
        .record_usage(UsageCategory::Conversation, 120_000)
        .unwrap();

    context.begin_session("tuesday").unwrap();
    assert_eq!(context.status().used, 0);
    assert_eq!(context.status().label, "fresh");

    let ids: Vec<String> = state
        .list_sessions()
        .unwrap()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"monday".to_string()));

    assert!(state.delete_session("monday").unwrap());
    assert_eq!(state.list_sessions().unwrap().len(), 1);
}
