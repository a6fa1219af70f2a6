//! Record usage and inspect token budgets from the command line.
//!
//! State lives under `--state-dir` (default `.agents/budget`), so separate
//! invocations see each other's usage.
//!
//! # Examples
//!
//! ```sh
//! # Record quota usage and show the rolling window
//! tokenwarden quota record 12000
//! tokenwarden quota status
//!
//! # Track a session's context by category
//! tokenwarden context record s1 file-read 2400 --label src/main.rs
//! tokenwarden context status s1
//!
//! # Preview, then apply, a compaction
//! tokenwarden context plan s1 strategic
//! tokenwarden context compact s1 strategic
//!
//! # Machine-readable output
//! tokenwarden --json sessions list
//! ```

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tokenwarden::budget::{BudgetStatus, Notification};
use tokenwarden::config::{DEFAULT_QUOTA_SCOPE, DEFAULT_STATE_DIR};
use tokenwarden::context::{CompactionLevel, ContextTracker, UsageCategory};
use tokenwarden::persist::persisted_state_schema;
use tokenwarden::{BudgetError, TokenAmount, WardenConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Rolling quota and session context budget tracker.
#[derive(Parser)]
#[command(name = "tokenwarden")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Directory holding persisted tracker state
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Tokens allowed per quota window
    #[arg(long, global = true)]
    quota_limit: Option<u64>,

    /// Quota window length in hours
    #[arg(long, global = true)]
    retention_hours: Option<i64>,

    /// Nominal context window of the model, in tokens
    #[arg(long, global = true)]
    context_max: Option<u64>,

    /// Fraction of the context window treated as usable (0.0 to 1.0)
    #[arg(long, global = true)]
    safety_margin: Option<f64>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Rolling-window quota
    #[command(subcommand)]
    Quota(QuotaCommand),
    /// Per-session context budget
    #[command(subcommand)]
    Context(ContextCommand),
    /// Persisted context sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Print the JSON Schema of the state files
    Schema,
}

#[derive(Subcommand)]
enum QuotaCommand {
    /// Record token usage
    Record {
        /// Whole number of tokens
        #[arg(allow_hyphen_values = true)]
        amount: String,
        /// Event time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        #[arg(long, default_value = DEFAULT_QUOTA_SCOPE)]
        scope: String,
    },
    /// Show usage, tier and time until the window next frees up
    Status {
        #[arg(long, default_value = DEFAULT_QUOTA_SCOPE)]
        scope: String,
    },
}

#[derive(Subcommand)]
enum ContextCommand {
    /// Record token usage in a category (file-read, tool-result, conversation, ...)
    Record {
        session: String,
        category: UsageCategory,
        /// Whole number of tokens
        #[arg(allow_hyphen_values = true)]
        amount: String,
        /// File path or tool name
        #[arg(long)]
        label: Option<String>,
    },
    /// Show usage breakdown and tier
    Status { session: String },
    /// Show what each compaction level would remove
    Opportunities { session: String },
    /// Preview a compaction (soft, strategic, emergency)
    Plan {
        session: String,
        level: CompactionLevel,
    },
    /// Run a compaction
    Compact {
        session: String,
        level: CompactionLevel,
    },
    /// Zero the session's ledger
    Reset { session: String },
}

#[derive(Subcommand)]
enum SessionsCommand {
    /// List persisted sessions, most recent first
    List,
    /// Delete a session's state file
    Delete { session: String },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_config(args: &GlobalArgs) -> Result<WardenConfig, BudgetError> {
    let mut config = WardenConfig::default().with_state_dir(&args.state_dir);
    if let Some(limit) = args.quota_limit {
        config.quota = config.quota.with_limit(limit);
    }
    if let Some(hours) = args.retention_hours {
        let retention = chrono::Duration::try_hours(hours).ok_or_else(|| {
            BudgetError::InvalidConfig {
                reason: format!("--retention-hours {hours} is out of range"),
            }
        })?;
        config.quota = config.quota.with_retention(retention);
    }
    if let Some(max) = args.context_max {
        config.context = config.context.with_max_tokens(max);
    }
    if let Some(margin) = args.safety_margin {
        config.context = config.context.with_safety_margin(margin);
    }
    Ok(config)
}

// ── Output ─────────────────────────────────────────────────────────

fn to_json<T: Serialize>(value: &T) -> Result<String, BudgetError> {
    Ok(serde_json::to_string_pretty(value)? + "\n")
}

fn render_status(scope: &str, status: &BudgetStatus) -> String {
    format!(
        "{scope}: {} of {} tokens ({:.1}%), level '{}'\n  {}\n",
        status.used,
        status.limit,
        status.display_percent(),
        status.label,
        status.recommendation
    )
}

fn render_recorded(notification: Option<Notification>, json: bool) -> Result<String, BudgetError> {
    if json {
        return to_json(&serde_json::json!({ "notification": notification }));
    }
    Ok(match notification {
        Some(n) => format!("[{}] {}\n", n.urgency, n.message),
        None => "recorded\n".to_string(),
    })
}

fn format_duration(d: chrono::Duration) -> String {
    let total = d.num_seconds().max(0);
    format!("{}h{:02}m{:02}s", total / 3600, (total % 3600) / 60, total % 60)
}

// ── Commands ───────────────────────────────────────────────────────

fn run(cli: &Cli) -> Result<String, BudgetError> {
    let config = build_config(&cli.global)?;
    let json = cli.global.json;

    match &cli.command {
        Command::Quota(cmd) => run_quota(&config, cmd, json),
        Command::Context(cmd) => run_context(&config, cmd, json),
        Command::Sessions(cmd) => run_sessions(&config, cmd, json),
        Command::Schema => to_json(&persisted_state_schema()),
    }
}

fn run_quota(config: &WardenConfig, cmd: &QuotaCommand, json: bool) -> Result<String, BudgetError> {
    match cmd {
        QuotaCommand::Record { amount, at, scope } => {
            let amount = amount.parse::<TokenAmount>()?.get();
            let mut quota = config.open_quota(scope)?;
            let notification = match at {
                Some(at) => quota.record_usage_at(amount, *at)?,
                None => quota.record_usage(amount)?,
            };
            render_recorded(notification, json)
        }
        QuotaCommand::Status { scope } => {
            let mut quota = config.open_quota(scope)?;
            quota.check_warnings()?;
            let status = quota.status();
            let reset_in = quota.time_to_reset();
            if json {
                return to_json(&serde_json::json!({
                    "scope": scope,
                    "status": status,
                    "remaining": status.remaining(),
                    "timeToResetSecs": reset_in.num_seconds(),
                }));
            }
            Ok(format!(
                "{}  next expiry in {}\n",
                render_status(scope, &status),
                format_duration(reset_in)
            ))
        }
    }
}

fn run_context(
    config: &WardenConfig,
    cmd: &ContextCommand,
    json: bool,
) -> Result<String, BudgetError> {
    match cmd {
        ContextCommand::Record {
            session,
            category,
            amount,
            label,
        } => {
            let amount = amount.parse::<TokenAmount>()?.get();
            let mut context = config.open_context(session);
            let notification = match label {
                Some(label) => context.record_item(category.clone(), amount, label.as_str())?,
                None => context.record_usage(category.clone(), amount)?,
            };
            render_recorded(notification, json)
        }
        ContextCommand::Status { session } => {
            let context = config.open_context(session);
            context_status(&context, json)
        }
        ContextCommand::Opportunities { session } => {
            let opportunities = config.open_context(session).identify_compaction_opportunities();
            if json {
                return to_json(&opportunities);
            }
            let mut out = format!(
                "{:<20} {:>10} {:>10} {:>10}\n",
                "category", "soft", "strategic", "emergency"
            );
            for (category, savings) in &opportunities.per_category {
                out.push_str(&format!(
                    "{:<20} {:>10} {:>10} {:>10}\n",
                    category.as_str(),
                    savings.soft,
                    savings.strategic,
                    savings.emergency
                ));
            }
            let totals = opportunities.totals;
            out.push_str(&format!(
                "{:<20} {:>10} {:>10} {:>10}\n",
                "total", totals.soft, totals.strategic, totals.emergency
            ));
            Ok(out)
        }
        ContextCommand::Plan { session, level } => {
            let plan = config.open_context(session).plan(*level);
            if json {
                return to_json(&plan);
            }
            let mut out = format!(
                "{level} compaction would free {} tokens\n",
                plan.estimated_savings
            );
            for (category, category_plan) in &plan.per_category {
                if category_plan.removable > 0 {
                    out.push_str(&format!(
                        "  {category}: {} -> {}\n",
                        category_plan.current,
                        category_plan.retained()
                    ));
                }
            }
            Ok(out)
        }
        ContextCommand::Compact { session, level } => {
            let mut context = config.open_context(session);
            let result = context.compact(*level)?;
            if json {
                return to_json(&result);
            }
            Ok(format!(
                "{} compaction freed {} tokens ({} -> {})\n",
                result.level, result.actual_savings, result.before, result.after
            ))
        }
        ContextCommand::Reset { session } => {
            let mut context = config.open_context(session);
            context.reset()?;
            Ok(format!("{session}: reset\n"))
        }
    }
}

fn context_status(context: &ContextTracker, json: bool) -> Result<String, BudgetError> {
    let status = context.status();
    let usage = context.usage();
    let suggested = context.suggested_compaction();
    if json {
        return to_json(&serde_json::json!({
            "sessionId": context.session_id(),
            "status": status,
            "remaining": context.remaining(),
            "breakdown": usage,
            "suggestedCompaction": suggested,
        }));
    }

    let mut out = render_status(context.session_id(), &status);
    for (category, tokens) in &usage.categories {
        out.push_str(&format!("  {category:<20} {tokens:>10}\n"));
    }
    if let Some(level) = suggested {
        out.push_str(&format!("  suggested compaction: {level}\n"));
    }
    Ok(out)
}

fn run_sessions(
    config: &WardenConfig,
    cmd: &SessionsCommand,
    json: bool,
) -> Result<String, BudgetError> {
    let state = config.state();
    match cmd {
        SessionsCommand::List => {
            let sessions = state.list_sessions()?;
            if json {
                return to_json(&sessions);
            }
            if sessions.is_empty() {
                return Ok("no sessions\n".to_string());
            }
            Ok(sessions
                .iter()
                .map(|s| {
                    format!(
                        "{:<32} {:>10} tokens  {}  {}\n",
                        s.session_id,
                        s.total,
                        s.last_updated.to_rfc3339(),
                        s.highest_level_fired.as_deref().unwrap_or("-")
                    )
                })
                .collect())
        }
        SessionsCommand::Delete { session } => {
            if state.delete_session(session)? {
                Ok(format!("deleted {session}\n"))
            } else {
                Ok(format!("no session named {session}\n"))
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    match run(&cli) {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
